//! 浏览器文件管理页面渲染（纯函数，每次请求渲染一次）。

use percent_encoding::{AsciiSet, CONTROLS, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::storage::FileEntry;

/// URL 路径段中需要转义的字符。
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'\'');

/// 查询参数值：除 unreserved 字符外全部转义，`+`、`&`、`=` 不得原样出现。
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub struct EditView<'a> {
    pub name: &'a str,
    pub content: &'a str,
}

pub struct PageView<'a> {
    /// 当前目录的卷内相对路径，根目录为空串。
    pub current_path: &'a str,
    pub entries: &'a [FileEntry],
    pub edit: Option<EditView<'a>>,
}

pub fn render_page(view: &PageView<'_>) -> String {
    let display_path = display_path(view.current_path);
    let base_href = dir_href(view.current_path);
    let mut rows = String::new();

    if !view.current_path.is_empty() {
        let parent = match view.current_path.rsplit_once('/') {
            Some((parent, _)) => dir_href(parent),
            None => "/".to_string(),
        };
        rows.push_str(&format!(
            r#"<tr class="up"><td colspan="3"><a href="{}">..</a></td></tr>"#,
            escape_html(&parent)
        ));
    }

    for entry in view.entries {
        rows.push_str(&render_row(&base_href, entry));
    }

    let editor = view
        .edit
        .as_ref()
        .map(|edit| render_editor(&base_href, edit))
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<title>Volume - {title}</title>
<style>
body {{ background: #0d1117; color: #c9d1d9; font-family: sans-serif; margin: 0; }}
main {{ max-width: 960px; margin: 2rem auto; padding: 0 1rem; }}
header {{ display: flex; justify-content: space-between; align-items: flex-end; gap: 1rem; flex-wrap: wrap; }}
h1 {{ color: #3fb950; margin: 0; font-size: 1.4rem; }}
.path {{ font-family: monospace; color: #8b949e; }}
table {{ width: 100%; border-collapse: collapse; margin-top: 1rem; background: #161b22; }}
td, th {{ padding: .5rem 1rem; border-bottom: 1px solid #21262d; text-align: left; }}
td.size, td.actions, th.right {{ text-align: right; }}
a {{ color: #58a6ff; text-decoration: none; }}
tr.dir a {{ color: #d29922; }}
button {{ background: #21262d; color: inherit; border: 1px solid #30363d; border-radius: 4px; cursor: pointer; }}
#editor {{ position: fixed; inset: 0; background: rgba(0,0,0,.85); display: flex; flex-direction: column; padding: 1rem; }}
#editor textarea {{ flex: 1; background: #0d1117; color: #c9d1d9; font-family: monospace; }}
</style>
</head>
<body>
<main>
<header>
<div><h1>Volume File Manager</h1><div class="path">{display}</div></div>
<div>
<button onclick="promptMkdir()">New Folder</button>
<form method="POST" enctype="multipart/form-data" action="{action}" style="display:inline">
<input type="file" name="file"><button type="submit">Upload</button>
</form>
</div>
</header>
<table>
<thead><tr><th>Name</th><th class="right">Size</th><th class="right">Actions</th></tr></thead>
<tbody>
{rows}
</tbody>
</table>
</main>
{editor}
<script>
function entryUrl(name) {{
  return {dir_js} + encodeURIComponent(name);
}}
async function deleteItem(name) {{
  if (confirm('Delete ' + name + '?')) {{
    await fetch(entryUrl(name), {{ method: 'DELETE' }});
    location.reload();
  }}
}}
async function extractZip(name) {{
  const res = await fetch(entryUrl(name) + '?extract=true', {{ method: 'POST' }});
  if (!res.ok) alert('Extract failed: ' + await res.text());
  location.reload();
}}
async function promptMkdir() {{
  const name = prompt('New folder name:');
  if (name) {{
    await fetch(entryUrl(name), {{ method: 'MKCOL' }});
    location.reload();
  }}
}}
</script>
</body>
</html>
"#,
        title = escape_html(&display_path),
        display = escape_html(&display_path),
        action = escape_html(&base_href),
        rows = rows,
        editor = editor,
        dir_js = js_string(&base_href),
    )
}

fn render_row(dir_href: &str, entry: &FileEntry) -> String {
    let encoded = utf8_percent_encode(&entry.name, PATH_SEGMENT).to_string();
    let name = escape_html(&entry.name);
    let (class, href, size) = if entry.is_dir {
        ("dir", format!("{dir_href}{encoded}/"), "--".to_string())
    } else {
        ("file", format!("{dir_href}{encoded}"), format!("{} B", entry.size))
    };

    let mut actions = String::new();
    if entry
        .ext
        .as_deref()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
    {
        actions.push_str(&format!(
            r#"<button data-name="{name}" onclick="extractZip(this.dataset.name)" title="Extract">unzip</button> "#
        ));
    }
    if !entry.is_dir {
        actions.push_str(&format!(
            r#"<a href="{}" title="Edit">edit</a> "#,
            escape_html(&edit_query(&entry.name))
        ));
    }
    actions.push_str(&format!(
        r#"<button data-name="{name}" onclick="deleteItem(this.dataset.name)" title="Delete">delete</button>"#
    ));

    format!(
        r#"<tr class="{class}"><td><a href="{href}">{name}</a></td><td class="size">{size}</td><td class="actions">{actions}</td></tr>
"#,
        href = escape_html(&href),
    )
}

fn render_editor(dir_href: &str, edit: &EditView<'_>) -> String {
    let save_url = format!("{dir_href}{}", edit_query(edit.name));
    format!(
        r#"<div id="editor">
<div><strong>Editing: {name}</strong>
<button onclick="saveFile()">Save</button>
<button onclick="window.location.href = window.location.pathname">Cancel</button></div>
<textarea id="editor-content" spellcheck="false"></textarea>
</div>
<script>
document.getElementById('editor-content').value = {content};
async function saveFile() {{
  const res = await fetch({save_url}, {{
    method: 'PUT',
    body: document.getElementById('editor-content').value
  }});
  if (res.ok) window.location.href = window.location.pathname;
  else alert('Save failed: ' + await res.text());
}}
</script>
"#,
        name = escape_html(edit.name),
        content = js_string(edit.content),
        save_url = js_string(&save_url),
    )
}

fn edit_query(name: &str) -> String {
    format!("?edit={}", utf8_percent_encode(name, QUERY_VALUE))
}

fn display_path(relative: &str) -> String {
    format!("/{relative}")
}

/// 目录的绝对 URL，以 `/` 结尾。
pub fn dir_href(relative: &str) -> String {
    let mut href = String::from("/");
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        href.push_str(&utf8_percent_encode(segment, PATH_SEGMENT).to_string());
        href.push('/');
    }
    href
}

/// 生成可直接嵌入 `<script>` 的 JS 字符串字面量。
fn js_string(value: &str) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "\"\"".to_string())
        .replace("</", "<\\/")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

pub fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, is_dir: bool, ext: Option<&str>) -> FileEntry {
        FileEntry {
            name: name.to_string(),
            path: name.to_string(),
            is_dir,
            size: if is_dir { 0 } else { 12 },
            ext: ext.map(str::to_string),
            modified: None,
        }
    }

    #[test]
    fn page_lists_entries_with_actions() {
        let entries = vec![
            entry("world", true, None),
            entry("backup.zip", false, Some("zip")),
        ];
        let html = render_page(&PageView {
            current_path: "",
            entries: &entries,
            edit: None,
        });
        assert!(html.contains(r#"href="/world/""#));
        assert!(html.contains(r#"href="/backup.zip""#));
        assert!(html.contains("extractZip(this.dataset.name)"));
        assert!(html.contains("12 B"));
        assert!(!html.contains(r#"class="up""#));
        assert!(!html.contains(r#"id="editor""#));
    }

    #[test]
    fn nested_page_links_to_parent() {
        let html = render_page(&PageView {
            current_path: "world/region",
            entries: &[],
            edit: None,
        });
        assert!(html.contains(r#"<a href="/world/">..</a>"#));
        assert!(html.contains("/world/region"));
    }

    #[test]
    fn names_and_content_are_escaped() {
        let entries = vec![entry("<b>x\".txt", false, Some("txt"))];
        let html = render_page(&PageView {
            current_path: "",
            entries: &entries,
            edit: Some(EditView {
                name: "<b>x\".txt",
                content: "</script><script>alert(1)</script>",
            }),
        });
        assert!(!html.contains("<b>x"));
        assert!(html.contains("&lt;b&gt;x&quot;.txt"));
        assert!(!html.contains("</script><script>alert(1)"));
        assert!(html.contains(r#"id="editor""#));
    }

    #[test]
    fn edit_links_escape_query_delimiters() {
        let entries = vec![entry("a+b&c=d.txt", false, Some("txt"))];
        let html = render_page(&PageView {
            current_path: "plugins",
            entries: &entries,
            edit: Some(EditView {
                name: "x&y.txt",
                content: "",
            }),
        });
        assert!(html.contains(r#"href="?edit=a%2Bb%26c%3Dd.txt""#));
        assert!(html.contains(r#""/plugins/?edit=x%26y.txt""#));
    }

    #[test]
    fn dir_href_encodes_segments() {
        assert_eq!(dir_href(""), "/");
        assert_eq!(dir_href("my world/nether"), "/my%20world/nether/");
    }
}
