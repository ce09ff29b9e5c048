//! Content types and binary detection
//!
//! Two independent judgments:
//! the extension tables (cheap, checked before content is read)
//! and [`is_utf8`] over the bytes themselves (authoritative).
//! They can disagree. A `.txt` full of invalid UTF-8 is binary as far as
//! the encoder is concerned, and an extensionless blob can be text.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use camino::Utf8Path;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

const CONTENT_TYPES: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("markdown", "text/markdown"),
    ("rst", "text/x-rst"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("scss", "text/x-scss"),
    ("less", "text/x-less"),
    ("csv", "text/csv"),
    ("tsv", "text/tab-separated-values"),
    ("xml", "application/xml"),
    ("svg", "image/svg+xml"),
    ("js", "application/javascript"),
    ("mjs", "application/javascript"),
    ("cjs", "application/javascript"),
    ("jsx", "text/jsx"),
    ("ts", "application/typescript"),
    ("tsx", "text/tsx"),
    ("json", "application/json"),
    ("jsonc", "application/json"),
    ("yaml", "application/yaml"),
    ("yml", "application/yaml"),
    ("toml", "application/toml"),
    ("ini", "text/plain"),
    ("cfg", "text/plain"),
    ("conf", "text/plain"),
    ("sh", "application/x-sh"),
    ("bash", "application/x-sh"),
    ("zsh", "application/x-sh"),
    ("ps1", "text/plain"),
    ("py", "text/x-python"),
    ("rb", "text/x-ruby"),
    ("rs", "text/x-rust"),
    ("go", "text/x-go"),
    ("java", "text/x-java"),
    ("kt", "text/x-kotlin"),
    ("swift", "text/x-swift"),
    ("c", "text/x-c"),
    ("h", "text/x-c"),
    ("cc", "text/x-c++"),
    ("cpp", "text/x-c++"),
    ("hpp", "text/x-c++"),
    ("cs", "text/x-csharp"),
    ("php", "application/x-httpd-php"),
    ("sql", "application/sql"),
    ("graphql", "application/graphql"),
    ("vue", "text/plain"),
    ("svelte", "text/plain"),
    ("lock", "text/plain"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("ico", "image/x-icon"),
    ("bmp", "image/bmp"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("wasm", "application/wasm"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
    ("otf", "font/otf"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
];

static CONTENT_TYPE_MAP: LazyLock<HashMap<&'static str, &'static str>> =
    LazyLock::new(|| CONTENT_TYPES.iter().copied().collect());

/// Extensions we're confident never hold text worth reading
static BINARY_EXTENSIONS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        // images
        "png", "jpg", "jpeg", "gif", "webp", "bmp", "ico", "icns", "tif", "tiff", "psd", "avif",
        "heic",
        // audio & video
        "mp3", "wav", "ogg", "flac", "aac", "m4a", "mp4", "m4v", "mov", "avi", "mkv", "webm",
        // fonts
        "woff", "woff2", "ttf", "otf", "eot",
        // archives
        "zip", "gz", "tgz", "bz2", "xz", "zst", "7z", "rar", "tar", "jar", "war",
        // documents
        "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx",
        // compiled & native
        "exe", "dll", "so", "dylib", "a", "o", "obj", "lib", "class", "pyc", "pyo", "wasm",
        "bin", "dat", "db", "sqlite", "sqlite3", "node",
    ]
    .into_iter()
    .collect()
});

/// The lowercased extension of the last path segment, if it has one
fn extension(path: &str) -> Option<String> {
    Utf8Path::new(path).extension().map(str::to_ascii_lowercase)
}

/// Picks a MIME type from the path's extension.
pub fn content_type(path: &str) -> &'static str {
    extension(path)
        .and_then(|ext| CONTENT_TYPE_MAP.get(ext.as_str()).copied())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
}

/// True if the path's extension is one we know to be binary
pub fn has_binary_extension(path: &str) -> bool {
    extension(path).is_some_and(|ext| BINARY_EXTENSIONS.contains(ext.as_str()))
}

/// Strict UTF-8 check over the actual bytes.
/// A BOM is just more valid UTF-8.
pub fn is_utf8(content: &[u8]) -> bool {
    std::str::from_utf8(content).is_ok()
}
