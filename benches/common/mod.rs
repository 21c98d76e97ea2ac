//! Common fixtures for benchmarks.

use std::collections::HashMap;
use tracewire::tracer::{Tracer, TracerRegistry};

/// Build a registry of `n` tracers, each with a distinct numeric id baked
/// into its tracer string so the tagging pass has real work to do.
pub fn registry_with_tracers(n: usize) -> TracerRegistry {
    let mut config = HashMap::new();
    for i in 0..n {
        config.insert(format!("[[XSS-{i}]]"), format!("<s data-id=\"{i}\">z</s>"));
    }
    TracerRegistry::load_from_config(&config)
}

/// A synthetic HTML page of roughly `size` bytes with tracer strings
/// scattered through it at regular intervals.
pub fn html_page_with_hits(tracers: &[Tracer], size: usize) -> String {
    let mut out = String::with_capacity(size);
    out.push_str("<html><body><div class=\"content\">");

    let filler = "lorem ipsum dolor sit amet consectetur adipiscing elit ";
    while out.len() < size {
        out.push_str(filler);
        if !tracers.is_empty() {
            let t = &tracers[out.len() % tracers.len()];
            out.push_str(&t.tracer_string);
        }
    }

    out.push_str("</div></body></html>");
    out
}
