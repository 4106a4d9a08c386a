use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::RewriteContext;

static CSS_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:'([^']*)'|"([^"]*)"|([^'"()\s]+))\s*\)"#)
        .expect("Invalid CSS url() regex")
});

/// Rewrites every `url(...)` reference in a stylesheet.
pub fn rewrite_css(css: &str, ctx: &RewriteContext) -> String {
    CSS_URL_RE
        .replace_all(css, |caps: &Captures<'_>| {
            let (quote, reference) = match (caps.get(1), caps.get(2), caps.get(3)) {
                (Some(m), _, _) => ("'", m.as_str()),
                (_, Some(m), _) => ("\"", m.as_str()),
                (_, _, Some(m)) => ("", m.as_str()),
                _ => return caps[0].to_string(),
            };
            match ctx.rewrite_url(reference) {
                Some(rewritten) => format!("url({quote}{rewritten}{quote})"),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
