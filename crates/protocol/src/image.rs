//! Inline image encoding for screenshots carried in JSON messages.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Encodes PNG bytes as a `data:` URL.
pub fn png_data_url(bytes: &[u8]) -> String {
	format!("{PNG_DATA_URL_PREFIX}{}", STANDARD.encode(bytes))
}

/// Encodes raw bytes as standard base64 for daemon frames.
pub fn encode_bytes(bytes: &[u8]) -> String {
	STANDARD.encode(bytes)
}

/// Decodes standard base64 from a daemon frame.
pub fn decode_bytes(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
	STANDARD.decode(data)
}

/// Decodes a PNG `data:` URL produced by [`png_data_url`].
pub fn decode_png_data_url(url: &str) -> Option<Vec<u8>> {
	url.strip_prefix(PNG_DATA_URL_PREFIX).and_then(|data| STANDARD.decode(data).ok())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn data_url_carries_png_prefix() {
		let url = png_data_url(&[0x89, b'P', b'N', b'G']);
		assert!(url.starts_with("data:image/png;base64,"));
		assert_eq!(decode_png_data_url(&url), Some(vec![0x89, b'P', b'N', b'G']));
	}

	#[test]
	fn foreign_urls_do_not_decode() {
		assert_eq!(decode_png_data_url("https://example.com/a.png"), None);
		assert!(decode_bytes("%%%").is_err());
	}
}
