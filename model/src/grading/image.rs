//! Photos of handwritten answers.

use base64::prelude::*;

const DEFAULT_MIME: &str = "image/jpeg";

/// A base64-encoded image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    pub mime: String,
    pub data: String,
}

impl Image {
    /// Parse an image sent by the frontend.
    ///
    /// Images normally arrive as data URLs (`data:image/png;base64,...`), but bare base64 is also
    /// accepted and assumed to be a JPEG. Returns [`None`] if there is no payload or the payload is
    /// not valid base64.
    pub fn parse(data_url: &str) -> Option<Self> {
        let s = data_url.trim();
        let (mime, data) = match s.strip_prefix("data:") {
            Some(rest) => {
                let (header, data) = rest.split_once(',')?;
                let mime = header
                    .split(';')
                    .next()
                    .map(|mime| mime.trim().to_lowercase())
                    .filter(|mime| !mime.is_empty())
                    .unwrap_or_else(|| DEFAULT_MIME.into());
                (mime, data.trim())
            }
            None => (DEFAULT_MIME.into(), s),
        };
        if data.is_empty() {
            return None;
        }
        match BASE64_STANDARD.decode(data) {
            Ok(bytes) => {
                tracing::debug!(%mime, bytes = bytes.len(), "parsed answer image");
            }
            Err(err) => {
                tracing::warn!(%mime, "answer image is not valid base64: {err}");
                return None;
            }
        }
        Some(Self {
            mime,
            data: data.into(),
        })
    }

    /// Re-encode this image as a data URL.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.data)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_data_url() {
        let image = Image::parse("data:image/PNG;base64,aGVsbG8=").unwrap();
        assert_eq!(image.mime, "image/png");
        assert_eq!(image.data, "aGVsbG8=");
        assert_eq!(image.data_url(), "data:image/png;base64,aGVsbG8=");
    }

    #[test]
    fn test_parse_bare_base64() {
        let image = Image::parse("  aGVsbG8=\n").unwrap();
        assert_eq!(image.mime, DEFAULT_MIME);
        assert_eq!(image.data, "aGVsbG8=");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(Image::parse(""), None);
        assert_eq!(Image::parse("data:image/png;base64"), None);
        assert_eq!(Image::parse("data:image/png;base64,"), None);
        assert_eq!(Image::parse("data:image/png;base64,not base64!"), None);
    }

    #[test]
    fn test_missing_mime_defaults_to_jpeg() {
        let image = Image::parse("data:;base64,aGVsbG8=").unwrap();
        assert_eq!(image.mime, DEFAULT_MIME);
    }
}
