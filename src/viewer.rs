use std::{fs, path::Path};

use anyhow::{Context, Result};

use crate::bundle;

const HEADER: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Student Score Visualizations</title>
    <style>
        body { font-family: Arial, sans-serif; margin: 20px; }
        .image-container { margin: 20px 0; text-align: center; }
        .image-container img { max-width: 100%; height: auto; border: 1px solid #ddd; }
        .image-title { font-weight: bold; margin: 10px 0; }
    </style>
</head>
<body>
    <h1>Student Score Data Visualizations</h1>
"#;

const FOOTER: &str = "</body>\n</html>\n";

/// `score_cdf_plot.png` becomes `Score Cdf Plot`.
pub fn title_from_file_name(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(name);

    let mut title = String::with_capacity(stem.len());
    let mut word_start = true;
    for c in stem.chars() {
        let c = if c == '_' { ' ' } else { c };
        if c.is_alphabetic() {
            if word_start {
                title.extend(c.to_uppercase());
            } else {
                title.extend(c.to_lowercase());
            }
            word_start = false;
        } else {
            title.push(c);
            word_start = true;
        }
    }
    title
}

pub fn render(names: &[String]) -> String {
    let mut html = String::from(HEADER);
    for name in names {
        let title = escape_html(&title_from_file_name(name));
        let src = escape_html(name);
        html.push_str(&format!(
            "    <div class=\"image-container\">\n        <div class=\"image-title\">{}</div>\n        <img src=\"{}\" alt=\"{}\">\n    </div>\n",
            title, src, title
        ));
    }
    html.push_str(FOOTER);
    html
}

/// Writes an HTML page showing every image in `dir`. Returns the number of
/// images on the page.
pub fn write_viewer(dir: &Path, extension: &str, output: &Path) -> Result<usize> {
    let names: Vec<String> = bundle::list_images(dir, extension)?
        .into_iter()
        .map(|image| image.name)
        .collect();
    fs::write(output, render(&names))
        .with_context(|| format!("unable to write {}", output.display()))?;
    Ok(names.len())
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
