//! Client runtime shim.
//!
//! A static script injected into every rewritten HTML page. It patches the
//! browser entry points that can issue requests or navigate (`fetch`,
//! `XMLHttpRequest.open`, `window.open`, `location.assign/replace`, the
//! History API, link clicks, form submissions and DOM insertions) so that
//! URLs built by page scripts are routed back through the proxy.
//!
//! The shim reads two globals set by the bootstrap script that precedes it:
//! `window.__PROXY_BASE__` and `window.__TARGET_ORIGIN__`.
//!
//! The tests below check the payload's structure and pin its contents to
//! [`SHIM_VERSION`]. They do not execute it; behaviour in a browser is
//! verified outside `cargo test`.

use crate::rewrite::RewriteContext;

/// Bumped whenever [`SHIM`] changes behaviour.
pub const SHIM_VERSION: u32 = 3;

/// The shim payload, delivered verbatim.
pub const SHIM: &str = r#"(function () {
  'use strict';
  if (window.__TOLLGATE_SHIM__) { return; }
  window.__TOLLGATE_SHIM__ = 3;

  var proxyBase = (window.__PROXY_BASE__ || window.location.origin).replace(/\/+$/, '');
  var targetOrigin = window.__TARGET_ORIGIN__ || '';
  var SKIP = ['data:', '#', 'mailto:', 'javascript:', 'blob:', 'about:'];

  function currentTarget() {
    var path = window.location.pathname.slice(1) + window.location.search + window.location.hash;
    return /^https?:\/\//i.test(path) ? path : targetOrigin + '/';
  }

  function isProxied(url) {
    return typeof url === 'string' && url.indexOf(proxyBase + '/') === 0;
  }

  function toProxy(url) {
    if (url === null || url === undefined) { return url; }
    var raw = String(url).trim();
    if (!raw || isProxied(raw)) { return raw; }
    var lower = raw.toLowerCase();
    for (var i = 0; i < SKIP.length; i++) {
      if (lower.indexOf(SKIP[i]) === 0) { return raw; }
    }
    if (raw.charAt(0) === '/' && raw.charAt(1) !== '/' && /^\/https?:\/\//i.test(raw)) {
      return proxyBase + raw;
    }
    try {
      var resolved = new URL(raw, currentTarget());
      if (resolved.protocol !== 'http:' && resolved.protocol !== 'https:') { return raw; }
      return proxyBase + '/' + resolved.href;
    } catch (e) {
      return raw;
    }
  }

  function rewriteSrcset(value) {
    return value.split(',').map(function (part) {
      var item = part.trim();
      var cut = item.search(/\s/);
      return cut > 0 ? toProxy(item.slice(0, cut)) + item.slice(cut) : toProxy(item);
    }).join(', ');
  }

  var nativeFetch = window.fetch;
  if (nativeFetch) {
    window.fetch = function (input, init) {
      try {
        if (typeof input === 'string' || input instanceof URL) {
          return nativeFetch.call(window, toProxy(String(input)), init);
        }
        if (input instanceof Request && !isProxied(input.url)) {
          return nativeFetch.call(window, new Request(toProxy(input.url), input), init);
        }
      } catch (e) {}
      return nativeFetch.call(window, input, init);
    };
  }

  var nativeOpen = XMLHttpRequest.prototype.open;
  XMLHttpRequest.prototype.open = function (method, url) {
    var args = Array.prototype.slice.call(arguments);
    if (typeof url === 'string' || url instanceof URL) { args[1] = toProxy(String(url)); }
    return nativeOpen.apply(this, args);
  };

  var nativeWindowOpen = window.open;
  window.open = function (url, name, features) {
    return nativeWindowOpen.call(window, url ? toProxy(String(url)) : url, name, features);
  };

  ['assign', 'replace'].forEach(function (name) {
    try {
      var native = window.location[name].bind(window.location);
      window.location[name] = function (url) { return native(toProxy(String(url))); };
    } catch (e) {}
  });

  function historyUrl(url) {
    if (url === null || url === undefined) { return url; }
    var raw = String(url);
    if (isProxied(raw) || /^\/https?:\/\//i.test(raw)) { return raw; }
    try {
      var resolved = new URL(raw, currentTarget());
      return '/' + resolved.href;
    } catch (e) {
      return raw;
    }
  }

  ['pushState', 'replaceState'].forEach(function (name) {
    var native = history[name];
    history[name] = function (state, title, url) {
      if (arguments.length < 3) { return native.apply(history, arguments); }
      try {
        return native.call(history, state, title, historyUrl(url));
      } catch (e) {
        return native.call(history, state, title, url);
      }
    };
  });

  document.addEventListener('click', function (event) {
    var node = event.target;
    while (node && node.nodeType === 1 && node.tagName !== 'A') { node = node.parentElement; }
    if (!node || node.tagName !== 'A') { return; }
    var href = node.getAttribute('href');
    if (href && !isProxied(href)) { node.setAttribute('href', toProxy(href)); }
  }, true);

  document.addEventListener('submit', function (event) {
    var form = event.target;
    if (!form || form.tagName !== 'FORM') { return; }
    var action = form.getAttribute('action');
    if (!action) {
      form.setAttribute('action', proxyBase + '/' + currentTarget());
    } else if (!isProxied(action)) {
      form.setAttribute('action', toProxy(action));
    }
  }, true);

  function patchElement(el) {
    ['src', 'href', 'poster', 'data-src'].forEach(function (attr) {
      var value = el.getAttribute(attr);
      if (value && !isProxied(value)) {
        var next = toProxy(value);
        if (next !== value) { el.setAttribute(attr, next); }
      }
    });
    var srcset = el.getAttribute('srcset');
    if (srcset) {
      var next = rewriteSrcset(srcset);
      if (next !== srcset) { el.setAttribute('srcset', next); }
    }
  }

  if (typeof MutationObserver !== 'undefined') {
    new MutationObserver(function (mutations) {
      mutations.forEach(function (mutation) {
        mutation.addedNodes.forEach(function (node) {
          if (node.nodeType !== 1) { return; }
          patchElement(node);
          if (node.querySelectorAll) {
            node.querySelectorAll('[src],[href],[srcset],[poster],[data-src]').forEach(patchElement);
          }
        });
      });
    }).observe(document.documentElement, { childList: true, subtree: true });
  }
})();"#;

/// Bootstrap script that hands the proxy and target origins to the shim.
pub fn bootstrap(proxy_base: &str, target_origin: &str) -> String {
    format!(
        "<script>window.__PROXY_BASE__ = {}; window.__TARGET_ORIGIN__ = {};</script>",
        js_string(proxy_base),
        js_string(target_origin)
    )
}

/// Markup injected at the top of `<head>`: bootstrap first, then the shim.
pub fn injection(ctx: &RewriteContext) -> String {
    format!(
        "{}<script>{}</script>",
        bootstrap(ctx.proxy_base(), &ctx.target_origin()),
        SHIM
    )
}

/// JSON string literal that is also safe inside a `<script>` element.
fn js_string(value: &str) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "\"\"".to_string())
        .replace("</", "<\\/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_literal() {
        assert_eq!(
            bootstrap("https://proxy.example", "https://site.example"),
            "<script>window.__PROXY_BASE__ = \"https://proxy.example\"; \
             window.__TARGET_ORIGIN__ = \"https://site.example\";</script>"
        );
    }

    #[test]
    fn test_bootstrap_cannot_close_script() {
        let out = bootstrap("https://p.example", "\"</script><b>");
        assert!(!out.contains("</script><b>"));
        assert_eq!(out.matches("</script>").count(), 1);
    }

    #[test]
    fn test_shim_patches_entry_points() {
        for hook in [
            "window.fetch =",
            "XMLHttpRequest.prototype.open =",
            "window.open =",
            "'assign', 'replace'",
            "'pushState', 'replaceState'",
            "addEventListener('click'",
            "addEventListener('submit'",
            "MutationObserver",
        ] {
            assert!(SHIM.contains(hook), "missing {hook}");
        }
    }

    #[test]
    fn test_shim_reads_bootstrap_globals() {
        assert!(SHIM.contains("window.__PROXY_BASE__"));
        assert!(SHIM.contains("window.__TARGET_ORIGIN__"));
        assert!(SHIM.contains(&format!("__TOLLGATE_SHIM__ = {SHIM_VERSION}")));
    }

    #[test]
    fn test_shim_is_self_contained_script() {
        assert!(!SHIM.contains("</script"));
        assert!(SHIM.starts_with("(function"));
        assert!(SHIM.ends_with("})();"));
    }

    /// FNV-1a, 64 bit.
    fn fingerprint(payload: &str) -> u64 {
        payload.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
        })
    }

    #[test]
    fn test_shim_version_tracks_payload() {
        // Editing SHIM requires bumping SHIM_VERSION and re-pinning both values.
        assert_eq!(
            (SHIM_VERSION, SHIM.len(), fingerprint(SHIM)),
            (3, 5278, 0x1a89_36ad_c0f4_0616),
            "SHIM changed without a SHIM_VERSION bump"
        );
    }

    #[test]
    fn test_injection_order() {
        let ctx = RewriteContext::new("https://site.example/a", "https://proxy.example").unwrap();
        let markup = injection(&ctx);
        let bootstrap_at = markup.find("__PROXY_BASE__ =").unwrap();
        let shim_at = markup.find("__TOLLGATE_SHIM__").unwrap();
        assert!(bootstrap_at < shim_at);
    }
}
