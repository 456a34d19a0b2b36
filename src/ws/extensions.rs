use crate::error::Error;

const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";

/// Negotiated permessage-deflate parameters.
///
/// The takeover flags control whether a direction's compression context is
/// reset between messages; the window bits bound the LZ77 window of that
/// direction. Larger windows (closer to 15) compress better but cost memory,
/// smaller windows (closer to 8) are faster with worse ratios.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extensions {
    /// Dictates if compression is enabled
    pub permessage_deflate: bool,
    /// The client resets its compression context after every message, and the
    /// server resets its decompression context accordingly.
    pub client_no_context_takeover: Option<bool>,
    /// The server resets its compression context after every message, and the
    /// client resets its decompression context accordingly.
    pub server_no_context_takeover: Option<bool>,
    pub client_max_window_bits: Option<u8>,
    pub server_max_window_bits: Option<u8>,
}

fn parse_window_bits(part: &str) -> Result<Option<u8>, Error> {
    match part.split_once('=') {
        None => Ok(Some(15)),
        Some((_, value)) => {
            let bits = value
                .trim()
                .trim_matches('"')
                .parse::<u8>()
                .map_err(|_| Error::UnknownExtensionParameter(part.to_string()))?;
            if !(8..=15).contains(&bits) {
                return Err(Error::UnknownExtensionParameter(part.to_string()));
            }
            Ok(Some(bits))
        }
    }
}

/// Parses one `Sec-WebSocket-Extensions` offer/answer.
///
/// Extensions other than permessage-deflate are ignored entirely; an unknown
/// parameter inside an accepted permessage-deflate block fails the handshake.
pub fn parse_extensions(extensions_header_value: &str) -> Result<Option<Extensions>, Error> {
    for offer in extensions_header_value.split(',') {
        let mut parts = offer.split(';');
        let name = parts.next().unwrap_or_default().trim();
        if name != PERMESSAGE_DEFLATE {
            continue;
        }
        let mut extensions = Extensions {
            permessage_deflate: true,
            ..Extensions::default()
        };
        for part in parts {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let key = part.split('=').next().unwrap_or_default().trim();
            match key {
                CLIENT_NO_CONTEXT_TAKEOVER => extensions.client_no_context_takeover = Some(true),
                SERVER_NO_CONTEXT_TAKEOVER => extensions.server_no_context_takeover = Some(true),
                CLIENT_MAX_WINDOW_BITS => {
                    extensions.client_max_window_bits = parse_window_bits(part)?
                }
                SERVER_MAX_WINDOW_BITS => {
                    extensions.server_max_window_bits = parse_window_bits(part)?
                }
                _ => return Err(Error::UnknownExtensionParameter(part.to_string())),
            }
        }
        return Ok(Some(extensions));
    }
    Ok(None)
}

/// Merges the server defaults with what the client offered, prioritizing the
/// server's own limits the way the accept path expects.
pub fn merge_extensions(
    server_extensions: Option<Extensions>,
    client_extensions: Option<Extensions>,
) -> Option<Extensions> {
    let server_ext = server_extensions?;
    let client_ext = client_extensions?;
    let min_bits = |a: Option<u8>, b: Option<u8>| match (a, b) {
        (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };
    Some(Extensions {
        permessage_deflate: client_ext.permessage_deflate && server_ext.permessage_deflate,
        client_no_context_takeover: server_ext
            .client_no_context_takeover
            .or(client_ext.client_no_context_takeover),
        server_no_context_takeover: server_ext
            .server_no_context_takeover
            .or(client_ext.server_no_context_takeover),
        client_max_window_bits: min_bits(
            server_ext.client_max_window_bits,
            client_ext.client_max_window_bits,
        ),
        server_max_window_bits: min_bits(
            server_ext.server_max_window_bits,
            client_ext.server_max_window_bits,
        ),
    })
}

/// Serializes the extension block for a handshake request or response header.
pub fn extensions_header_value(extensions: &Extensions) -> Option<String> {
    if !extensions.permessage_deflate {
        return None;
    }
    let mut value = String::from(PERMESSAGE_DEFLATE);
    if extensions.client_no_context_takeover == Some(true) {
        value.push_str(&format!("; {}", CLIENT_NO_CONTEXT_TAKEOVER));
    }
    if extensions.server_no_context_takeover == Some(true) {
        value.push_str(&format!("; {}", SERVER_NO_CONTEXT_TAKEOVER));
    }
    if let Some(bits) = extensions.client_max_window_bits {
        if bits == 15 {
            value.push_str(&format!("; {}", CLIENT_MAX_WINDOW_BITS));
        } else {
            value.push_str(&format!("; {}={}", CLIENT_MAX_WINDOW_BITS, bits));
        }
    }
    if let Some(bits) = extensions.server_max_window_bits {
        value.push_str(&format!("; {}={}", SERVER_MAX_WINDOW_BITS, bits));
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_offer() {
        let ext = parse_extensions("permessage-deflate").unwrap().unwrap();
        assert!(ext.permessage_deflate);
        assert_eq!(ext.client_max_window_bits, None);
    }

    #[test]
    fn test_parse_parameters() {
        let ext = parse_extensions(
            "permessage-deflate; client_max_window_bits; server_max_window_bits=10; server_no_context_takeover",
        )
        .unwrap()
        .unwrap();
        assert_eq!(ext.client_max_window_bits, Some(15));
        assert_eq!(ext.server_max_window_bits, Some(10));
        assert_eq!(ext.server_no_context_takeover, Some(true));
        assert_eq!(ext.client_no_context_takeover, None);
    }

    #[test]
    fn test_unknown_extension_ignored() {
        assert!(parse_extensions("permessage-bzip2; level=9")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_unknown_parameter_fails() {
        assert!(parse_extensions("permessage-deflate; memory_level=9").is_err());
    }

    #[test]
    fn test_window_bits_range() {
        assert!(parse_extensions("permessage-deflate; server_max_window_bits=7").is_err());
        assert!(parse_extensions("permessage-deflate; server_max_window_bits=16").is_err());
        assert!(parse_extensions("permessage-deflate; server_max_window_bits=8").is_ok());
    }

    #[test]
    fn test_merge_prefers_smaller_window() {
        let server = Extensions {
            permessage_deflate: true,
            server_max_window_bits: Some(10),
            ..Extensions::default()
        };
        let client = Extensions {
            permessage_deflate: true,
            server_max_window_bits: Some(15),
            client_max_window_bits: Some(12),
            ..Extensions::default()
        };
        let merged = merge_extensions(Some(server), Some(client)).unwrap();
        assert_eq!(merged.server_max_window_bits, Some(10));
        assert_eq!(merged.client_max_window_bits, Some(12));
    }

    #[test]
    fn test_header_value_roundtrip() {
        let ext = Extensions {
            permessage_deflate: true,
            client_no_context_takeover: Some(true),
            server_max_window_bits: Some(10),
            ..Extensions::default()
        };
        let value = extensions_header_value(&ext).unwrap();
        let parsed = parse_extensions(&value).unwrap().unwrap();
        assert_eq!(parsed, ext);
    }
}
