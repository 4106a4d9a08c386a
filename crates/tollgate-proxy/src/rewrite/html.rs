use std::cell::{Cell, RefCell};

use lol_html::html_content::{ContentType, Element};
use lol_html::{element, rewrite_str, text, RewriteStrSettings};
use once_cell::sync::Lazy;
use regex::Regex;

use super::{rewrite_css, RewriteContext};
use crate::error::{ProxyError, Result};
use crate::shim;

/// URL-bearing attributes and the elements they are rewritten on.
const URL_ATTRIBUTES: &[(&str, &[&str])] = &[
    ("href", &["a", "link", "area"]),
    (
        "src",
        &[
            "img", "script", "iframe", "audio", "video", "source", "track", "embed", "object",
            "frame",
        ],
    ),
    ("poster", &["video"]),
    ("action", &["form"]),
];

/// Lazy-loading attributes rewritten on any element.
const DATA_ATTRIBUTES: &[&str] = &["data-src", "data-href", "data-url", "data-background"];

const SRCSET_ELEMENTS: &[&str] = &["img", "source"];

static META_REFRESH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^\s*(\d+)\s*;\s*url\s*=\s*['"]?([^'"]*?)['"]?\s*$"#)
        .expect("Invalid meta refresh regex")
});

type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Rewrites an HTML document and injects the client shim.
///
/// The bootstrap and shim scripts are prepended to `<head>`; documents
/// without one get them at the very start.
pub fn rewrite_html(html: &str, ctx: &RewriteContext) -> Result<String> {
    let injection = shim::injection(ctx);
    let injected = Cell::new(false);
    let style_buffer = RefCell::new(String::new());

    let output = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("head", |el| {
                    if !injected.get() {
                        el.prepend(&injection, ContentType::Html);
                        injected.set(true);
                    }
                    Ok(())
                }),
                element!("*", |el| rewrite_element(el, ctx)),
                text!("style", |chunk| {
                    style_buffer.borrow_mut().push_str(chunk.as_str());
                    if chunk.last_in_text_node() {
                        let css = std::mem::take(&mut *style_buffer.borrow_mut());
                        chunk.replace(&rewrite_css(&css, ctx), ContentType::Html);
                    } else {
                        chunk.remove();
                    }
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::new()
        },
    )
    .map_err(|e| ProxyError::Http(format!("HTML rewrite failed: {e}")))?;

    if injected.get() {
        Ok(output)
    } else {
        Ok(format!("{injection}{output}"))
    }
}

fn rewrite_element(el: &mut Element<'_, '_>, ctx: &RewriteContext) -> HandlerResult {
    let tag = el.tag_name().to_ascii_lowercase();

    if tag == "meta" && rewrite_meta(el, ctx) {
        return Ok(());
    }

    for (attr, tags) in URL_ATTRIBUTES {
        if tags.contains(&tag.as_str()) {
            rewrite_attribute(el, attr, ctx)?;
        }
    }

    for attr in DATA_ATTRIBUTES {
        rewrite_attribute(el, attr, ctx)?;
    }

    if SRCSET_ELEMENTS.contains(&tag.as_str()) {
        if let Some(srcset) = el.get_attribute("srcset") {
            el.set_attribute("srcset", &rewrite_srcset(&srcset, ctx))?;
        }
    }

    if tag == "img" && el.has_attribute("src") {
        el.set_attribute("loading", "eager")?;
    }

    if let Some(style) = el.get_attribute("style") {
        let rewritten = rewrite_css(&style, ctx);
        if rewritten != style {
            el.set_attribute("style", &rewritten)?;
        }
    }

    if el.has_attribute("integrity") {
        el.remove_attribute("integrity");
    }

    Ok(())
}

fn rewrite_attribute(el: &mut Element<'_, '_>, attr: &str, ctx: &RewriteContext) -> HandlerResult {
    if let Some(value) = el.get_attribute(attr) {
        if let Some(rewritten) = ctx.rewrite_url(&value) {
            el.set_attribute(attr, &rewritten)?;
        }
    }
    Ok(())
}

/// Handles `<meta http-equiv>`. Returns true if the element was removed.
fn rewrite_meta(el: &mut Element<'_, '_>, ctx: &RewriteContext) -> bool {
    let Some(equiv) = el.get_attribute("http-equiv") else {
        return false;
    };

    if equiv.eq_ignore_ascii_case("content-security-policy") {
        el.remove();
        return true;
    }

    if equiv.eq_ignore_ascii_case("refresh") {
        if let Some(content) = el.get_attribute("content") {
            if let Some(rewritten) = rewrite_refresh(&content, ctx) {
                if let Err(e) = el.set_attribute("content", &rewritten) {
                    tracing::debug!(error = %e, "Failed to set meta refresh");
                }
            }
        }
    }
    false
}

fn rewrite_refresh(content: &str, ctx: &RewriteContext) -> Option<String> {
    let caps = META_REFRESH_RE.captures(content)?;
    let delay = caps.get(1)?.as_str();
    let target = ctx.rewrite_url(caps.get(2)?.as_str())?;
    Some(format!("{delay};url={target}"))
}

/// Rewrites each candidate URL of a `srcset`, keeping its descriptor.
fn rewrite_srcset(srcset: &str, ctx: &RewriteContext) -> String {
    srcset
        .split(',')
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .map(|candidate| match candidate.split_once(char::is_whitespace) {
            Some((url, descriptor)) => {
                format!("{} {}", ctx.rewrite_or_keep(url), descriptor.trim())
            }
            None => ctx.rewrite_or_keep(candidate),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROXY: &str = "https://proxy.example";

    fn ctx() -> RewriteContext {
        RewriteContext::new("https://site.example/dir/page.html", PROXY).unwrap()
    }

    fn proxied(target: &str) -> String {
        format!("{PROXY}/{target}")
    }

    #[test]
    fn test_anchor_and_script() {
        let html = r#"<html><head></head><body><a href="/about">x</a><script src="app.js"></script></body></html>"#;
        let out = rewrite_html(html, &ctx()).unwrap();

        assert!(out.contains(&format!(r#"href="{}""#, proxied("https://site.example/about"))));
        assert!(out.contains(&format!(r#"src="{}""#, proxied("https://site.example/dir/app.js"))));
    }

    #[test]
    fn test_shim_injected_into_head() {
        let html = "<html><head><title>t</title></head><body></body></html>";
        let out = rewrite_html(html, &ctx()).unwrap();

        let head = out.find("<head>").unwrap();
        let bootstrap = out.find("window.__PROXY_BASE__ = ").unwrap();
        let shim = out.find("__TOLLGATE_SHIM__").unwrap();
        let title = out.find("<title>").unwrap();
        assert!(head < bootstrap && bootstrap < shim && shim < title);
        assert!(out.contains(r#"window.__TARGET_ORIGIN__ = "https://site.example";"#));
    }

    #[test]
    fn test_shim_prepended_without_head() {
        let out = rewrite_html("<p>bare</p>", &ctx()).unwrap();
        assert!(out.starts_with("<script>window.__PROXY_BASE__"));
        assert!(out.ends_with("<p>bare</p>"));
    }

    #[test]
    fn test_special_schemes_untouched() {
        let html = r##"<a href="#top">a</a><a href="mailto:x@y.example">b</a><a href="javascript:void(0)">c</a><img src="data:image/gif;base64,R0lG">"##;
        let out = rewrite_html(html, &ctx()).unwrap();
        assert!(out.contains(r##"href="#top""##));
        assert!(out.contains(r#"href="mailto:x@y.example""#));
        assert!(out.contains(r#"href="javascript:void(0)""#));
        assert!(out.contains(r#"src="data:image/gif;base64,R0lG""#));
    }

    #[test]
    fn test_srcset_descriptors_preserved() {
        let html = r#"<img srcset="a.png 1x, /b.png 2x">"#;
        let out = rewrite_html(html, &ctx()).unwrap();
        let expected = format!(
            r#"srcset="{} 1x, {} 2x""#,
            proxied("https://site.example/dir/a.png"),
            proxied("https://site.example/b.png")
        );
        assert!(out.contains(&expected), "{out}");
    }

    #[test]
    fn test_img_eager_and_integrity_stripped() {
        let html = r#"<img src="a.png" loading="lazy"><script src="x.js" integrity="sha384-abc"></script>"#;
        let out = rewrite_html(html, &ctx()).unwrap();
        assert!(out.contains(r#"loading="eager""#));
        assert!(!out.contains("integrity"));
    }

    #[test]
    fn test_data_attributes_and_poster() {
        let html = r#"<div data-background="/bg.jpg"></div><video poster="p.jpg" src="v.mp4"></video>"#;
        let out = rewrite_html(html, &ctx()).unwrap();
        assert!(out.contains(&format!(r#"data-background="{}""#, proxied("https://site.example/bg.jpg"))));
        assert!(out.contains(&format!(r#"poster="{}""#, proxied("https://site.example/dir/p.jpg"))));
        assert!(out.contains(&format!(r#"src="{}""#, proxied("https://site.example/dir/v.mp4"))));
    }

    #[test]
    fn test_form_action() {
        let out = rewrite_html(r#"<form action="/search"></form>"#, &ctx()).unwrap();
        assert!(out.contains(&format!(r#"action="{}""#, proxied("https://site.example/search"))));
    }

    #[test]
    fn test_csp_meta_removed() {
        let html = r#"<head><meta http-equiv="Content-Security-Policy" content="default-src 'self'"><meta charset="utf-8"></head>"#;
        let out = rewrite_html(html, &ctx()).unwrap();
        assert!(!out.contains("Content-Security-Policy"));
        assert!(out.contains(r#"<meta charset="utf-8">"#));
    }

    #[test]
    fn test_meta_refresh() {
        let html = r#"<meta http-equiv="refresh" content="5; URL='/next'">"#;
        let out = rewrite_html(html, &ctx()).unwrap();
        assert!(out.contains(&format!(r#"content="5;url={}""#, proxied("https://site.example/next"))));
    }

    #[test]
    fn test_style_block_and_attribute() {
        let html = r#"<style>body{background:url(/bg.png)}</style><div style="background:url('i.png')"></div>"#;
        let out = rewrite_html(html, &ctx()).unwrap();
        assert!(out.contains(&format!(
            "body{{background:url({})}}",
            proxied("https://site.example/bg.png")
        )));
        assert!(out.contains(&proxied("https://site.example/dir/i.png")));
    }

    #[test]
    fn test_idempotent_on_proxied_urls() {
        let html = format!(
            r#"<a href="{}">x</a><img src="{}">"#,
            proxied("https://site.example/a"),
            proxied("https://site.example/b.png")
        );
        let out = rewrite_html(&html, &ctx()).unwrap();
        assert!(out.contains(&format!(r#"href="{}""#, proxied("https://site.example/a"))));
        assert!(!out.contains(&format!("{PROXY}/{PROXY}")));

        let twice = rewrite_html(&out, &ctx()).unwrap();
        assert!(!twice.contains(&format!("{PROXY}/{PROXY}")));
    }

    #[test]
    fn test_malformed_url_left_alone() {
        let html = r#"<a href="http://[broken">x</a><a href="/ok">y</a>"#;
        let out = rewrite_html(html, &ctx()).unwrap();
        assert!(out.contains(r#"href="http://[broken""#));
        assert!(out.contains(&proxied("https://site.example/ok")));
    }
}
