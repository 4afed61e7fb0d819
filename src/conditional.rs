//! 条件请求：下载的 304 与 If-Range，编辑写入前的 412。
//!
//! 实体标签由文件大小与纳秒级修改时间组成，视为强校验器；
//! HTTP 日期只有秒级精度，比较前统一截断到秒。

use axum::http::{HeaderMap, header};
use httpdate::{fmt_http_date, parse_http_date};
use std::fs::Metadata;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ApiError;

/// 文件当前的校验器（ETag 与修改时间）。
#[derive(Debug, Clone)]
pub struct Validators {
    etag: String,
    modified: Option<SystemTime>,
}

impl Validators {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let modified = metadata.modified().ok();
        let etag = match modified.and_then(|ts| ts.duration_since(UNIX_EPOCH).ok()) {
            Some(since_epoch) => format!(
                "\"{:x}-{:x}.{:09}\"",
                metadata.len(),
                since_epoch.as_secs(),
                since_epoch.subsec_nanos()
            ),
            None => format!("\"{:x}\"", metadata.len()),
        };
        Self { etag, modified }
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn last_modified(&self) -> Option<String> {
        self.modified.map(fmt_http_date)
    }

    /// If-None-Match（弱比较）优先；没有该头时才看 If-Modified-Since。
    pub fn is_not_modified(&self, headers: &HeaderMap) -> bool {
        if let Some(value) = header_str(headers, header::IF_NONE_MATCH) {
            return list_matches(value, |tag| weak_eq(tag, &self.etag));
        }
        match (
            header_str(headers, header::IF_MODIFIED_SINCE).and_then(parse_date),
            self.modified_secs(),
        ) {
            (Some(since), Some(modified)) => modified <= since,
            _ => false,
        }
    }

    /// If-Range 成立时才按 Range 返回部分内容，否则回退到完整文件。
    /// 实体标签用强比较，日期须与 Last-Modified 完全一致。
    pub fn range_applies(&self, headers: &HeaderMap) -> bool {
        let Some(value) = header_str(headers, header::IF_RANGE) else {
            return true;
        };
        let value = value.trim();
        if value.starts_with('"') || value.starts_with("W/") {
            return strong_eq(value, &self.etag);
        }
        match (parse_date(value), self.modified_secs()) {
            (Some(date), Some(modified)) => date == modified,
            _ => false,
        }
    }

    fn modified_secs(&self) -> Option<u64> {
        self.modified.and_then(unix_secs)
    }
}

/// 编辑写入前的前置条件：If-Match / If-Unmodified-Since / If-None-Match。
/// `current` 为 None 表示目标尚不存在。
pub fn check_write_preconditions(
    headers: &HeaderMap,
    current: Option<&Validators>,
) -> Result<(), ApiError> {
    if let Some(value) = header_str(headers, header::IF_MATCH) {
        let matched = match current {
            Some(current) => list_matches(value, |tag| strong_eq(tag, &current.etag)),
            None => false,
        };
        if !matched {
            return Err(precondition_failed("If-Match"));
        }
    } else if let Some(since) =
        header_str(headers, header::IF_UNMODIFIED_SINCE).and_then(parse_date)
        && let Some(modified) = current.and_then(Validators::modified_secs)
        && modified > since
    {
        return Err(precondition_failed("If-Unmodified-Since"));
    }

    if let Some(value) = header_str(headers, header::IF_NONE_MATCH) {
        let matched = match current {
            Some(current) => list_matches(value, |tag| weak_eq(tag, &current.etag)),
            None => false,
        };
        if matched {
            return Err(precondition_failed("If-None-Match"));
        }
    }

    Ok(())
}

fn precondition_failed(header_name: &str) -> ApiError {
    ApiError::PreconditionFailed(format!("{header_name} precondition failed"))
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// `*` 匹配任意现存文件，否则逐个比较逗号分隔的标签。
fn list_matches(value: &str, matches: impl Fn(&str) -> bool) -> bool {
    let value = value.trim();
    value == "*" || value.split(',').map(str::trim).any(matches)
}

fn strong_eq(a: &str, b: &str) -> bool {
    !a.starts_with("W/") && !b.starts_with("W/") && a == b
}

fn weak_eq(a: &str, b: &str) -> bool {
    a.trim_start_matches("W/") == b.trim_start_matches("W/")
}

fn parse_date(value: &str) -> Option<u64> {
    parse_http_date(value.trim()).ok().and_then(unix_secs)
}

fn unix_secs(ts: SystemTime) -> Option<u64> {
    ts.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}
