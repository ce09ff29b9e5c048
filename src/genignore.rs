//! Finding a repository's `.genignore` before the real pass
//!
//! `.genignore` lists paths that shouldn't be fed to an LLM:
//! lockfiles, vendored code, build output.
//! Its lines are added to `excludePathPatterns` and matched the same way.
//! It has to be known before filtering starts, but it's somewhere in
//! the same archive we're about to filter. So we decode the front of the
//! archive once, recording what we read, and then replay that for the main pass.
//!
//! GitHub-style archives sort entries by path, so root-level dotfiles come
//! before everything else. We stop looking at the first root-level entry
//! that isn't a dotfile. Archives from other producers might put `.genignore`
//! later, in which case we won't see it and use the defaults.

use std::io;

use log::*;

use crate::detect::ArchiveFormat;
use crate::reader::{ArchiveReader, DecoderOptions};
use crate::result::*;
use crate::source::{ByteSource, Recorder, Replay};

pub const GENIGNORE_FILE: &str = ".genignore";

/// Larger `.genignore` files are ignored.
pub const MAX_GENIGNORE_LEN: u64 = 64 * 1024;

/// How much of the archive we'll hold onto while looking.
/// The recording refuses to grow past this, even in the middle of an entry.
pub const MAX_PREPASS_LEN: usize = 16 * 1024 * 1024;

/// Used when the archive doesn't have its own `.genignore`.
///
/// These go through the same matching as `excludePathPatterns`,
/// so they're written to match at any depth, with or without the archive's top folder.
pub const DEFAULT_GENIGNORE: &[&str] = &[
    "**/node_modules/**",
    "**/bower_components/**",
    "**/vendor/**",
    "**/.git/**",
    "**/dist/**",
    "**/build/**",
    "**/out/**",
    "**/target/**",
    "**/coverage/**",
    "**/.next/**",
    "**/.nuxt/**",
    "**/.cache/**",
    "**/__pycache__/**",
    "**/.venv/**",
    "**/venv/**",
    "*.min.js",
    "*.min.css",
    "*.map",
    "**/package-lock.json",
    "**/yarn.lock",
    "**/pnpm-lock.yaml",
    "**/bun.lockb",
    "**/Cargo.lock",
    "**/poetry.lock",
    "**/composer.lock",
    "**/Gemfile.lock",
    "**/go.sum",
];

/// Excludes the root `.genignore` itself, whether or not the top folder is kept.
const GENIGNORE_SELF: &str = "{.genignore,*/.genignore}";

/// Pulls patterns out of a `.genignore`:
/// every line that isn't blank, a `#` comment, or a `!` negation.
pub fn parse(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('!'))
        .map(str::to_owned)
        .collect()
}

pub fn default_patterns() -> Vec<String> {
    DEFAULT_GENIGNORE.iter().map(|p| p.to_string()).collect()
}

/// What the pre-pass found, and the source to use for the main pass
pub struct Resolution<S> {
    pub patterns: Vec<String>,
    /// False if these are the defaults.
    pub found: bool,
    pub source: Replay<S>,
}

enum Lookup {
    Found(Vec<String>),
    NotFound,
}

/// Looks for `<root>/.genignore` at the front of the archive.
///
/// Never fails: any problem along the way means we use the defaults.
pub async fn resolve<S: ByteSource>(source: S, format: ArchiveFormat) -> Resolution<S> {
    let options = DecoderOptions {
        verify_crc: false,
        buffer_limit: Some(MAX_GENIGNORE_LEN),
    };
    let recorder = Recorder::with_limit(source, MAX_PREPASS_LEN);
    let mut reader = ArchiveReader::new(recorder, format, options);

    let lookup = find(&mut reader).await;
    let source = reader.into_source().into_replay();
    match lookup {
        Ok(Lookup::Found(patterns)) => {
            debug!("Found {GENIGNORE_FILE} with {} patterns", patterns.len());
            Resolution {
                patterns,
                found: true,
                source,
            }
        }
        Ok(Lookup::NotFound) => {
            debug!("No {GENIGNORE_FILE}; using defaults");
            Resolution {
                patterns: default_patterns(),
                found: false,
                source,
            }
        }
        Err(IngestError::Io(e)) if e.kind() == io::ErrorKind::OutOfMemory => {
            debug!("{e} without finding {GENIGNORE_FILE}; using defaults");
            Resolution {
                patterns: default_patterns(),
                found: false,
                source,
            }
        }
        Err(e) => {
            warn!("Couldn't look for {GENIGNORE_FILE} ({e}); using defaults");
            Resolution {
                patterns: default_patterns(),
                found: false,
                source,
            }
        }
    }
}

async fn find<S: ByteSource>(reader: &mut ArchiveReader<Recorder<S>>) -> IngestResult<Lookup> {
    while let Some(entry) = reader.next_entry().await? {
        let segments: Vec<&str> = entry.path.split('/').filter(|s| !s.is_empty()).collect();
        if let [_root, name] = segments[..] {
            if name == GENIGNORE_FILE && entry.is_file() {
                if !entry.content.is_available() {
                    warn!("{} is over {MAX_GENIGNORE_LEN} bytes; ignoring it", entry.path);
                    return Ok(Lookup::NotFound);
                }
                let content = entry.content.read_all()?;
                let mut patterns = parse(&String::from_utf8_lossy(&content));
                // The file is configuration, not content.
                patterns.push(GENIGNORE_SELF.to_owned());
                return Ok(Lookup::Found(patterns));
            }
            if !name.starts_with('.') {
                trace!("Reached {}; giving up on {GENIGNORE_FILE}", entry.path);
                return Ok(Lookup::NotFound);
            }
        }
        entry.content.cancel();
    }
    Ok(Lookup::NotFound)
}
