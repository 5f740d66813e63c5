use std::sync::OnceLock;

use chrono::{Datelike, Local};
use html_escape::{encode_double_quoted_attribute, encode_safe};
use regex::Regex;

pub const LOGO_CID: &str = "logo";

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{Image(\d*)\}").expect("image token pattern"))
}

/// Inline image referenced from a rendered body. `ordinal` is 1-based into the
/// session's inline image list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineRef {
    pub cid: String,
    pub ordinal: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedBody {
    pub html: String,
    pub inline: Vec<InlineRef>,
}

#[derive(Debug, Clone, Default)]
pub struct Branding {
    pub name: Option<String>,
    pub tagline: Option<String>,
    pub has_logo: bool,
}

pub fn inline_cid(row_index: usize, ordinal: usize) -> String {
    format!("img{}_{}", row_index, ordinal)
}

/// Turns a filled body into an HTML fragment. Text is escaped and newlines
/// become `<br>`; only `{ImageN}` tokens produce markup.
pub fn render_body(body: &str, row_index: usize, image_count: usize) -> RenderedBody {
    let mut html = String::with_capacity(body.len() + 64);
    let mut inline: Vec<InlineRef> = Vec::new();
    let mut last = 0;
    for caps in token_re().captures_iter(body) {
        let Some(token) = caps.get(0) else { continue };
        html.push_str(&escape_text(&body[last..token.start()]));
        last = token.end();

        let ordinal = caps
            .get(1)
            .and_then(|m| m.as_str().parse::<usize>().ok())
            .unwrap_or(1);
        if ordinal == 0 || ordinal > image_count {
            continue;
        }
        let cid = inline_cid(row_index, ordinal);
        html.push_str(&format!(
            "<img src=\"cid:{}\" style=\"max-width:100%\">",
            encode_double_quoted_attribute(&cid)
        ));
        if !inline.iter().any(|r| r.cid == cid) {
            inline.push(InlineRef { cid, ordinal });
        }
    }
    html.push_str(&escape_text(&body[last..]));
    RenderedBody { html, inline }
}

fn escape_text(text: &str) -> String {
    encode_safe(text)
        .replace("\r\n", "\n")
        .replace('\n', "<br>")
}

pub fn wrap_document(fragment: &str, branding: &Branding) -> String {
    let year = Local::now().year();
    let name = branding
        .name
        .as_deref()
        .map(|n| encode_safe(n).to_string())
        .unwrap_or_default();
    let tagline = branding
        .tagline
        .as_deref()
        .map(|t| encode_safe(t).to_string())
        .unwrap_or_default();

    let mut header = String::new();
    if branding.has_logo || !name.is_empty() {
        header.push_str("<tr><td style=\"padding:18px 22px; background:#f7fbff;\"><table role=\"presentation\" cellpadding=\"0\" cellspacing=\"0\"><tr>");
        if branding.has_logo {
            header.push_str(&format!(
                "<td style=\"vertical-align:middle; padding-right:12px;\"><img src=\"cid:{}\" alt=\"logo\" width=\"56\" class=\"logo\" style=\"border-radius:8px;\" /></td>",
                LOGO_CID
            ));
        }
        if !name.is_empty() {
            header.push_str(&format!(
                "<td style=\"vertical-align:middle;\"><div class=\"h1\">{}</div></td>",
                name
            ));
        }
        header.push_str("</tr></table></td></tr>");
    }

    let mut footer = String::new();
    if !name.is_empty() {
        footer.push_str(&format!(
            "<tr><td style=\"padding:18px 22px 26px 22px; font-size:12px; color:#6b7280;\"><div style=\"font-weight:700; color:#134AAD; font-size:13px; margin-bottom:6px;\">{}</div>",
            name
        ));
        if !tagline.is_empty() {
            footer.push_str(&format!("<div style=\"margin-bottom:6px;\">{}</div>", tagline));
        }
        footer.push_str(&format!(
            "<div style=\"color:#9aa0a6; font-size:11px;\">&copy; {} {}. All rights reserved.</div></td></tr>",
            year, name
        ));
    }

    format!(
        r#"<!doctype html>
<html>
<head>
<meta http-equiv="Content-Type" content="text/html; charset=UTF-8" />
<meta name="viewport" content="width=device-width, initial-scale=1.0"/>
<style>
body {{ margin:0; padding:0; background-color:#eef3fb; }}
table {{ border-collapse:collapse; }}
img {{ border:0; max-width:100%; height:auto; display:block; }}
.outer {{ width:100%; background-color:#eef3fb; padding:24px 12px; }}
.container {{ max-width:720px; margin:0 auto; }}
.card {{ background:#ffffff; border-radius:12px; overflow:hidden; }}
.pad {{ padding:24px 26px; }}
.h1 {{ font-size:20px; font-weight:700; color:#134AAD; margin:0; }}
.body-text {{ font-size:15px; color:#0f1724; line-height:1.55; }}
@media only screen and (max-width:600px) {{
  .pad {{ padding:16px !important; }}
  .logo {{ width:48px !important; }}
  .body-text {{ font-size:14px !important; }}
}}
</style>
</head>
<body>
<table role="presentation" class="outer" width="100%" cellpadding="0" cellspacing="0"><tr><td align="center">
<table role="presentation" class="container card" width="100%" cellpadding="0" cellspacing="0">
{header}
<tr><td class="pad body-text">{fragment}</td></tr>
{footer}
</table>
</td></tr></table>
</body>
</html>
"#
    )
}
