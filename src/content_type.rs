use std::path::Path;

/// Response content types, resolved once per response.
///
/// Enum indices keep the lookup a plain array read, no hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    #[default]
    TextPlain = 0,
    TextHtml = 1,
    TextCss = 2,
    TextXml = 3,
    TextXsl = 4,
    ApplicationJson = 5,
    ApplicationXml = 6,
    ApplicationJavascript = 7,
    ApplicationOctetStream = 8,
    ImageSvgXml = 9,
    FontTrueType = 10,
    FontOpenType = 11,
    FontWoff = 12,
    FontWoff2 = 13,
    FontEot = 14,
    ImagePng = 15,
    ImageJpg = 16,
    ImageGif = 17,
    ImageXIcon = 18,
    ImageIcns = 19,
    ImageBmp = 20,
}

impl ContentType {
    const STRINGS: [&'static str; 21] = [
        "text/plain; charset=utf-8",
        "text/html; charset=utf-8",
        "text/css; charset=utf-8",
        "text/xml; charset=utf-8",
        "text/xsl; charset=utf-8",
        "application/json; charset=utf-8",
        "application/xml; charset=utf-8",
        "application/javascript; charset=utf-8",
        "application/octet-stream",
        "image/svg+xml",
        "application/x-font-truetype",
        "application/x-font-opentype",
        "application/font-woff",
        "application/font-woff2",
        "application/vnd.ms-fontobject",
        "image/png",
        "image/jpeg",
        "image/gif",
        "image/x-icon",
        "image/icns",
        "image/bmp",
    ];

    pub fn as_str(self) -> &'static str {
        Self::STRINGS[self as usize]
    }

    /// Resolve a content type from the file name extension (the part
    /// after the last dot). Unknown or missing extensions fall back
    /// to `application/octet-stream`.
    pub fn for_filename(path: &Path) -> Self {
        let Some(ext) = path.extension().and_then(|s| s.to_str()) else {
            return ContentType::ApplicationOctetStream;
        };

        match ext.to_ascii_lowercase().as_str() {
            "html" | "htm" => ContentType::TextHtml,
            "js" => ContentType::ApplicationJavascript,
            "css" => ContentType::TextCss,
            "json" => ContentType::ApplicationJson,
            "xml" => ContentType::TextXml,
            "xsl" => ContentType::TextXsl,
            "txt" => ContentType::TextPlain,
            "svg" => ContentType::ImageSvgXml,
            "ttf" => ContentType::FontTrueType,
            "otf" => ContentType::FontOpenType,
            "woff2" => ContentType::FontWoff2,
            "woff" => ContentType::FontWoff,
            "eot" => ContentType::FontEot,
            "png" => ContentType::ImagePng,
            "jpg" | "jpeg" => ContentType::ImageJpg,
            "gif" => ContentType::ImageGif,
            "bmp" => ContentType::ImageBmp,
            "ico" => ContentType::ImageXIcon,
            "icns" => ContentType::ImageIcns,
            _ => ContentType::ApplicationOctetStream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_lookup() {
        assert_eq!(
            ContentType::for_filename(Path::new("index.html")),
            ContentType::TextHtml
        );
        assert_eq!(
            ContentType::for_filename(Path::new("a/b/app.JS")),
            ContentType::ApplicationJavascript
        );
        assert_eq!(
            ContentType::for_filename(Path::new("noext")),
            ContentType::ApplicationOctetStream
        );
        assert_eq!(
            ContentType::for_filename(Path::new("weird.zzz")),
            ContentType::ApplicationOctetStream
        );
    }

    #[test]
    fn resolver_is_stable() {
        // resolve(extension) -> content type -> string must be a fixed
        // point: feeding a representative filename for each known
        // extension always yields the same content type again.
        for ext in [
            "html", "js", "css", "json", "xml", "xsl", "txt", "svg", "ttf", "otf", "woff",
            "woff2", "eot", "png", "jpg", "jpeg", "gif", "bmp", "ico", "icns",
        ] {
            let name = format!("file.{ext}");
            let ct = ContentType::for_filename(Path::new(&name));
            assert_ne!(ct.as_str(), "");
            assert_eq!(ContentType::for_filename(Path::new(&name)), ct);
        }
    }

    #[test]
    fn html_content_type_has_charset() {
        assert_eq!(ContentType::TextHtml.as_str(), "text/html; charset=utf-8");
    }
}
