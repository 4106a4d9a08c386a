use super::RewriteContext;

/// Rewrites segment and sub-playlist lines of an HLS manifest.
///
/// Tag lines (`#...`) and blank lines pass through unchanged.
pub fn rewrite_hls(manifest: &str, ctx: &RewriteContext) -> String {
    let mut out = String::with_capacity(manifest.len() * 2);
    let mut lines = manifest.split('\n').peekable();

    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out.push_str(line);
        } else {
            match ctx.rewrite_url(trimmed) {
                Some(rewritten) => {
                    out.push_str(&rewritten);
                    if line.ends_with('\r') {
                        out.push('\r');
                    }
                }
                None => {
                    tracing::debug!(line = trimmed, "HLS line kept as written");
                    out.push_str(line);
                }
            }
        }
        if lines.peek().is_some() {
            out.push('\n');
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_lines() {
        let ctx =
            RewriteContext::new("https://cdn.example/live/index.m3u8", "https://proxy.example")
                .unwrap();
        let manifest = "#EXTM3U\n#EXTINF:10,\nsegment001.ts\n\nhttps://other.example/seg2.ts\n";

        let out = rewrite_hls(manifest, &ctx);
        let lines: Vec<&str> = out.split('\n').collect();

        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXTINF:10,");
        assert_eq!(
            lines[2],
            "https://proxy.example/https://cdn.example/live/segment001.ts"
        );
        assert_eq!(lines[3], "");
        assert_eq!(
            lines[4],
            "https://proxy.example/https://other.example/seg2.ts"
        );
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn test_crlf_preserved() {
        let ctx = RewriteContext::new("https://cdn.example/a/b.m3u8", "https://p.example").unwrap();
        let out = rewrite_hls("#EXTM3U\r\nlow/index.m3u8\r\n", &ctx);
        assert_eq!(
            out,
            "#EXTM3U\r\nhttps://p.example/https://cdn.example/a/low/index.m3u8\r\n"
        );
    }

    #[test]
    fn test_already_proxied_lines_untouched() {
        let ctx = RewriteContext::new("https://cdn.example/a/b.m3u8", "https://p.example").unwrap();
        let manifest = "#EXTM3U\nhttps://p.example/https://cdn.example/a/s1.ts";
        assert_eq!(rewrite_hls(manifest, &ctx), manifest);
    }
}
