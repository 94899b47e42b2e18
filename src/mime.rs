use std::collections::HashMap;

const DEFAULT_EXTENSIONS_MAP: &'static [&'static str] = &[
    "application/javascript  js",
    "application/json        json",
    "application/msword      doc",
    "application/ogg         ogg",
    "application/pdf         pdf",
    "application/wasm        wasm",
    "application/xml         xsl xml",
    "application/zip         zip",
    "audio/mpeg              mp2 mp3 mpga",
    "audio/wav               wav",
    "font/ttf                ttf",
    "font/woff               woff",
    "font/woff2              woff2",
    "image/bmp               bmp",
    "image/gif               gif",
    "image/jpeg              jpeg jpe jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "image/x-icon            ico",
    "text/css                css",
    "text/html               html htm",
    "text/plain              txt asc",
    "video/mp4               mp4",
    "video/mpeg              mpeg mpe mpg",
    "video/quicktime         qt mov",
    "video/x-msvideo         avi",
];

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Extension to media type lookup, seeded from the built-in table.
#[derive(Debug)]
pub struct MimeMap {
    mimetypes: HashMap<String, String>,
    default_mimetype: String,
}

impl MimeMap {
    pub fn parse_default_extension_map() -> MimeMap {
        let mut mime_map = MimeMap {
            mimetypes: HashMap::new(),
            default_mimetype: DEFAULT_MIME_TYPE.to_string(),
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }

    /// Add line from an extension map.
    fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c| matches!(c, ' ' | '\t'))
            .filter(|field| field.len() > 0);
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype,
            None => return, // empty line
        };
        if mimetype.starts_with('#') {
            return; // comment
        }
        for extension in fields {
            self.mimetypes
                .insert(extension.to_string(), mimetype.to_string());
        }
    }

    /// Get content type for a path or URL.
    pub fn content_type(&self, path: &str) -> &str {
        path.rsplit('.')
            .next()
            .and_then(|extension| self.mimetypes.get(&extension.to_ascii_lowercase()))
            .unwrap_or(&self.default_mimetype)
    }
}
