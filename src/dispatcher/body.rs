//! Body reading with a hard size cap, model-name extraction, and the
//! alias-resolved body rewrite (§4.3 steps 1, 2, 4).

use actix_web::web::{Bytes, BytesMut};
use actix_web::HttpRequest;
use futures::StreamExt;

use crate::error::ProxyError;

/// Reads `payload` up to `cap_bytes`, failing with `kPayloadTooLarge` the
/// moment the cap is exceeded rather than after buffering the whole body.
pub async fn read_capped_body(
    mut payload: actix_web::web::Payload,
    cap_bytes: usize,
) -> Result<Bytes, ProxyError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| ProxyError::BadRequest(e.to_string()))?;
        if buf.len() + chunk.len() > cap_bytes {
            return Err(ProxyError::PayloadTooLarge { actual: buf.len() + chunk.len(), limit: cap_bytes });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Extracts the `model` field from a JSON body. Returns `kStartFailed`-style
/// `BadRequest` (HTTP 400) if the field is absent, per §4.3 step 2.
pub fn extract_model_name_json(body: &[u8]) -> Result<String, ProxyError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| ProxyError::BadRequest(format!("invalid JSON body: {e}")))?;
    value
        .get("model")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ProxyError::BadRequest("request body is missing the 'model' field".to_string()))
}

/// Rewrites the JSON body's top-level `model` field to `new_name` by
/// splicing just that field's value span, leaving every other byte —
/// including key order, whitespace, and number formatting — untouched.
/// Deliberately avoids a parse-then-reserialize round trip through
/// `serde_json::Value`: without the `preserve_order` feature its
/// `BTreeMap`-backed object reorders keys alphabetically on every
/// reserialization, which would violate §4.3 step 4's "preserve byte order
/// elsewhere". Idempotent: applying it twice with the same `new_name` is a
/// no-op on the second application (P5), since the spliced-in value already
/// reads `new_name`. Returns the original bytes unchanged if no top-level
/// `model` string field is found (callers only invoke this after a
/// successful `extract_model_name_json`, so the field is known to exist).
pub fn rewrite_model_name_json(body: &[u8], new_name: &str) -> Result<Bytes, ProxyError> {
    match find_top_level_string_field(body, "model") {
        Some((value_start, value_end)) => {
            let replacement =
                serde_json::to_string(new_name).map_err(|e| ProxyError::Internal(e.to_string()))?;
            let mut out = Vec::with_capacity(body.len() - (value_end - value_start) + replacement.len());
            out.extend_from_slice(&body[..value_start]);
            out.extend_from_slice(replacement.as_bytes());
            out.extend_from_slice(&body[value_end..]);
            Ok(Bytes::from(out))
        }
        None => Ok(Bytes::copy_from_slice(body)),
    }
}

/// Scans `body` for a string-valued field named `key` directly inside the
/// root object (depth 1; nested objects/arrays are skipped over, not
/// descended into) and returns the byte range of its value, quotes included.
/// A minimal hand-rolled scanner rather than a full parse, since all this
/// needs is one field's span, not a parsed tree.
fn find_top_level_string_field(body: &[u8], key: &str) -> Option<(usize, usize)> {
    let len = body.len();
    let mut depth: i32 = 0;
    let mut i = 0;
    while i < len {
        if body[i] == b'"' {
            let (str_start, str_end) = scan_json_string(body, i)?;
            if depth == 1 && &body[str_start + 1..str_end - 1] == key.as_bytes() {
                let mut j = str_end;
                while j < len && body[j].is_ascii_whitespace() {
                    j += 1;
                }
                if j < len && body[j] == b':' {
                    j += 1;
                    while j < len && body[j].is_ascii_whitespace() {
                        j += 1;
                    }
                    if j < len && body[j] == b'"' {
                        return scan_json_string(body, j);
                    }
                }
            }
            i = str_end;
            continue;
        }
        match body[i] {
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    None
}

/// Returns the `(start, end)` byte range of the JSON string literal starting
/// at `body[start]` (which must be `"`), `end` being one past the closing
/// quote. Honors backslash escapes so an escaped quote doesn't end the scan
/// early.
fn scan_json_string(body: &[u8], start: usize) -> Option<(usize, usize)> {
    let len = body.len();
    let mut i = start + 1;
    while i < len {
        match body[i] {
            b'\\' => i += 2,
            b'"' => return Some((start, i + 1)),
            _ => i += 1,
        }
    }
    None
}

/// Extracts the model name from a multipart form field of the same name,
/// used by the audio endpoints. Spills fields larger than
/// `memory_cap_bytes` to a temporary file rather than holding them in
/// memory; only the `model` field's value is read back into memory here; the
/// rest of the form is forwarded as opaque bytes by the caller.
pub async fn extract_model_name_multipart(
    body: &[u8],
    boundary: &str,
    memory_cap_bytes: usize,
) -> Result<Option<String>, ProxyError> {
    use std::io::Write;

    let mut multipart = multer::Multipart::new(futures::stream::once(async { Ok::<_, std::io::Error>(Bytes::copy_from_slice(body)) }), boundary);

    while let Some(mut field) = multipart.next_field().await.map_err(|e| ProxyError::BadRequest(e.to_string()))? {
        if field.name() != Some("model") {
            continue;
        }
        let mut collected = Vec::new();
        let mut spilled: Option<tempfile::NamedTempFile> = None;
        while let Some(chunk) = field.chunk().await.map_err(|e| ProxyError::BadRequest(e.to_string()))? {
            if let Some(file) = spilled.as_mut() {
                file.write_all(&chunk).map_err(|e| ProxyError::Internal(e.to_string()))?;
                continue;
            }
            if collected.len() + chunk.len() > memory_cap_bytes {
                let mut file = tempfile::NamedTempFile::new().map_err(|e| ProxyError::Internal(e.to_string()))?;
                file.write_all(&collected).map_err(|e| ProxyError::Internal(e.to_string()))?;
                file.write_all(&chunk).map_err(|e| ProxyError::Internal(e.to_string()))?;
                spilled = Some(file);
            } else {
                collected.extend_from_slice(&chunk);
            }
        }
        if let Some(file) = spilled {
            let contents = std::fs::read(file.path()).map_err(|e| ProxyError::Internal(e.to_string()))?;
            return Ok(Some(String::from_utf8_lossy(&contents).trim().to_string()));
        }
        return Ok(Some(String::from_utf8_lossy(&collected).trim().to_string()));
    }
    Ok(None)
}

pub fn multipart_boundary(req: &HttpRequest) -> Option<String> {
    let content_type = req.headers().get(actix_web::http::header::CONTENT_TYPE)?.to_str().ok()?;
    multer::parse_boundary(content_type).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_model_field_from_json() {
        let body = br#"{"model":"m1","messages":[]}"#;
        assert_eq!(extract_model_name_json(body).unwrap(), "m1");
    }

    #[test]
    fn missing_model_field_is_bad_request() {
        let body = br#"{"messages":[]}"#;
        let err = extract_model_name_json(body).unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }

    #[test]
    fn rewrite_replaces_model_field_only() {
        let body = br#"{"model":"gpt-4o","messages":[{"role":"user"}],"temperature":0.5}"#;
        let rewritten = rewrite_model_name_json(body, "real-m4").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value["model"], "real-m4");
        assert_eq!(value["temperature"], 0.5);
        assert_eq!(value["messages"][0]["role"], "user");
    }

    #[test]
    fn rewrite_preserves_key_order_and_surrounding_bytes() {
        let body = br#"{"temperature": 0.5,"model":"gpt-4o",  "messages":[{"role":"user"}]}"#;
        let rewritten = rewrite_model_name_json(body, "real-m4").unwrap();
        let expected = br#"{"temperature": 0.5,"model":"real-m4",  "messages":[{"role":"user"}]}"#;
        assert_eq!(&rewritten[..], &expected[..]);
    }

    #[test]
    fn rewrite_ignores_nested_model_keys() {
        let body = br#"{"model":"gpt-4o","metadata":{"model":"should-not-change"}}"#;
        let rewritten = rewrite_model_name_json(body, "real-m4").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value["model"], "real-m4");
        assert_eq!(value["metadata"]["model"], "should-not-change");
    }

    #[test]
    fn rewrite_applied_twice_equals_applied_once() {
        let body = br#"{"model":"gpt-4o","x":1}"#;
        let once = rewrite_model_name_json(body, "real-m4").unwrap();
        let twice = rewrite_model_name_json(&once, "real-m4").unwrap();
        let once_value: serde_json::Value = serde_json::from_slice(&once).unwrap();
        let twice_value: serde_json::Value = serde_json::from_slice(&twice).unwrap();
        assert_eq!(once_value, twice_value);
    }
}
