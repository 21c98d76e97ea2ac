//! Scans an outbound request for active tracer strings and substitutes the
//! corresponding payloads.
//!
//! Matching policy (spec.md §4.4): literal, case-sensitive, non-overlapping,
//! left-to-right; the longest `tracerString` wins on prefix ties.
//! Replacement is string-level, never regex.

use crate::tracer::Tracer;
use std::io::Read;

/// Where a substitution happened, for the `(requestID, tracerID,
/// location-kind)` record handed to the external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    Url,
    Header,
    Body,
}

/// One recorded substitution. `TagRecord`s accumulated across a request are
/// what `Scanner::correlate` checks a `TracerEvent` against (spec.md §8's
/// scan-correlation invariant).
#[derive(Debug, Clone)]
pub struct TagRecord {
    pub tracer_id: u64,
    pub location: LocationKind,
}

/// Replace every non-overlapping, longest-match occurrence of an active
/// tracer string in `input`, left to right. Returns the rewritten string
/// plus one `TagRecord` per substitution (location supplied by the caller,
/// since this function doesn't know whether it's scanning a URL, a header
/// value, or the body).
pub fn tag_string(input: &str, tracers: &[Tracer], location: LocationKind) -> (String, Vec<TagRecord>) {
    if tracers.is_empty() || input.is_empty() {
        return (input.to_string(), Vec::new());
    }

    // Longest tracerString first so prefix ties resolve to the longest.
    let mut ordered: Vec<&Tracer> = tracers.iter().collect();
    ordered.sort_by(|a, b| b.tracer_string.len().cmp(&a.tracer_string.len()));

    let mut output = String::with_capacity(input.len());
    let mut records = Vec::new();
    let bytes = input.as_bytes();
    let mut pos = 0usize;

    'outer: while pos < bytes.len() {
        for tracer in &ordered {
            let needle = tracer.tracer_string.as_str();
            if !needle.is_empty() && input[pos..].starts_with(needle) {
                output.push_str(&tracer.tracer_payload);
                records.push(TagRecord {
                    tracer_id: tracer.id,
                    location,
                });
                pos += needle.len();
                continue 'outer;
            }
        }
        // No match at this position: copy one char and advance.
        let ch = input[pos..].chars().next().expect("pos is a char boundary");
        output.push(ch);
        pos += ch.len_utf8();
    }

    (output, records)
}

/// Rewrite a request body given the currently active tracers. If
/// `content_encoding` names gzip, the body is decoded before tagging and
/// the `Content-Encoding` header is expected to be dropped by the caller
/// (the outbound body is no longer compressed, per spec.md DESIGN NOTES
/// §9: "operate on a decoded body after Content-Encoding reversal").
/// A decode failure returns the original bytes untouched and no records,
/// matching the documented pass-through-untagged limitation.
pub fn tag_body(
    body: &[u8],
    content_encoding: Option<&str>,
    tracers: &[Tracer],
) -> (Vec<u8>, Vec<TagRecord>) {
    let decoded = match content_encoding {
        Some(enc) if enc.contains("gzip") => match decompress_gzip(body) {
            Ok(bytes) => bytes,
            Err(_) => return (body.to_vec(), Vec::new()),
        },
        _ => body.to_vec(),
    };

    match std::str::from_utf8(&decoded) {
        Ok(text) => {
            let (tagged, records) = tag_string(text, tracers, LocationKind::Body);
            (tagged.into_bytes(), records)
        }
        Err(_) => (decoded, Vec::new()),
    }
}

fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    use flate2::read::GzDecoder;
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}
