//! JavaScript evaluated inside the page during full-audit rendering.

/// Core web vitals and navigation timing.
///
/// LCP and layout shifts are only reachable through buffered
/// `PerformanceObserver`s; unsupported entry types degrade to null rather
/// than throwing.
pub const PERFORMANCE_SCRIPT: &str = r#"
    (() => {
        const out = { ttfb_ms: null, fcp_ms: null, lcp_ms: null, cls: null, tbt_ms: null };

        const nav = performance.getEntriesByType('navigation')[0];
        if (nav) {
            out.ttfb_ms = nav.responseStart - nav.startTime;
        }

        const fcp = performance.getEntriesByName('first-contentful-paint')[0];
        if (fcp) {
            out.fcp_ms = fcp.startTime;
        }

        const observe = (type, handle) => {
            try {
                const po = new PerformanceObserver(() => {});
                po.observe({ type, buffered: true });
                handle(po.takeRecords());
                po.disconnect();
            } catch (e) { /* entry type unsupported */ }
        };

        observe('largest-contentful-paint', entries => {
            const last = entries[entries.length - 1];
            if (last) out.lcp_ms = last.startTime;
        });

        observe('layout-shift', entries => {
            let cls = 0;
            for (const e of entries) {
                if (!e.hadRecentInput) cls += e.value;
            }
            out.cls = cls;
        });

        observe('longtask', entries => {
            let tbt = 0;
            for (const e of entries) {
                const blocking = e.duration - 50;
                if (blocking > 0) tbt += blocking;
            }
            out.tbt_ms = tbt;
        });

        return out;
    })()
"#;

/// Computed styles for visible text nodes, capped to keep evaluation cheap
/// on very large documents.
pub const COMPUTED_STYLES_SCRIPT: &str = r#"
    (() => {
        const MAX_NODES = 500;
        const out = [];

        const cssPath = (el) => {
            if (el.id) return el.tagName.toLowerCase() + '#' + el.id;
            let path = el.tagName.toLowerCase();
            if (el.classList.length > 0) path += '.' + el.classList[0];
            const parent = el.parentElement;
            if (parent && parent !== document.body && parent !== document.documentElement) {
                let prefix = parent.tagName.toLowerCase();
                if (parent.id) prefix += '#' + parent.id;
                path = prefix + ' > ' + path;
            }
            return path;
        };

        const walker = document.createTreeWalker(document.body, NodeFilter.SHOW_TEXT);
        const seen = new Set();
        while (out.length < MAX_NODES) {
            const node = walker.nextNode();
            if (!node) break;
            const text = node.textContent.trim();
            if (!text) continue;
            const el = node.parentElement;
            if (!el || seen.has(el)) continue;
            seen.add(el);

            const style = getComputedStyle(el);
            if (style.display === 'none' || style.visibility === 'hidden') continue;

            out.push({
                selector: cssPath(el),
                text: text.slice(0, 120),
                font_size: parseFloat(style.fontSize) || null,
                font_weight: parseInt(style.fontWeight) || null,
                color: style.color || null,
                background_color: style.backgroundColor || null,
                line_height: style.lineHeight || null
            });
        }
        return out;
    })()
"#;
