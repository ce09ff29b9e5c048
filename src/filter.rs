//! Deciding which entries make it into the output
//!
//! A [`FilterConfiguration`] comes from the request's query string.
//! It's compiled once per request into a [`CompiledMatcherSet`],
//! which then judges every entry's path (and declared size)
//! without any further allocation beyond path padding.

use std::collections::HashSet;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use log::*;
use url::form_urlencoded;

use crate::classify::has_binary_extension;
use crate::detect::ArchiveFormat;

/// Per-request filter settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfiguration {
    /// Directory prefixes to allow. Any one will do.
    pub base_paths: Vec<String>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub enable_fuzzy_matching: bool,
    pub max_file_size: Option<u64>,
    /// Drop the archive's top-level folder from every path.
    pub omit_first_segment: bool,
    pub omit_binary: bool,
    /// Binary files are referenced under this URL instead of embedded.
    pub raw_url_prefix: Option<String>,
    /// Look for a `.genignore` in the archive before filtering.
    pub genignore: bool,
    /// More exclusions, from `.genignore` or the defaults.
    /// Compiled exactly like `exclude_patterns`.
    pub genignore_patterns: Vec<String>,
    /// Skip format sniffing.
    pub format: Option<ArchiveFormat>,
}

impl Default for FilterConfiguration {
    fn default() -> Self {
        Self {
            base_paths: Vec::new(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            enable_fuzzy_matching: false,
            max_file_size: None,
            omit_first_segment: false,
            omit_binary: false,
            raw_url_prefix: None,
            genignore: true,
            genignore_patterns: Vec::new(),
            format: None,
        }
    }
}

/// Query-string booleans: a bare key or `true`/`1`/`yes` is true.
fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "" | "true" | "1" | "yes"
    )
}

impl FilterConfiguration {
    /// Parses the query string (without the leading `?`).
    ///
    /// Repeated list parameters accumulate.
    /// Unknown keys and unparseable values are ignored.
    pub fn from_query(query: &str) -> Self {
        let mut config = Self::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let value = value.trim();
            match key.as_ref() {
                "omitFirstSegment" => config.omit_first_segment = parse_bool(value),
                "omitBinary" => config.omit_binary = parse_bool(value),
                "enableFuzzyMatching" => config.enable_fuzzy_matching = parse_bool(value),
                "genignore" => config.genignore = parse_bool(value),
                "rawUrlPrefix" => {
                    config.raw_url_prefix = (!value.is_empty()).then(|| value.to_owned())
                }
                "basePath" if !value.is_empty() => config.base_paths.push(value.to_owned()),
                "pathPatterns" if !value.is_empty() => {
                    config.include_patterns.push(value.to_owned())
                }
                "excludePathPatterns" if !value.is_empty() => {
                    config.exclude_patterns.push(value.to_owned())
                }
                "maxFileSize" => match value.parse() {
                    Ok(max) => config.max_file_size = Some(max),
                    Err(_) => debug!("Ignoring maxFileSize={value}"),
                },
                "format" => match value.parse() {
                    Ok(format) => config.format = Some(format),
                    Err(_) => warn!("Unknown archive format {value:?}; sniffing instead"),
                },
                _ => {}
            }
        }
        config
    }
}

/// Why an entry was left out
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FilterReason {
    TooLarge,
    NoBasePathMatch,
    NotIncluded,
    ExcludedByPattern,
    BinaryExtension,
}

impl FilterReason {
    /// The HTTP-ish status code reported in `x-filter`
    pub fn status(self) -> &'static str {
        match self {
            FilterReason::TooLarge => "413",
            FilterReason::BinaryExtension => "415",
            FilterReason::NoBasePathMatch
            | FilterReason::NotIncluded
            | FilterReason::ExcludedByPattern => "404",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            FilterReason::TooLarge => "Content too large",
            FilterReason::BinaryExtension => "Binary file",
            FilterReason::NoBasePathMatch => "No base path match",
            FilterReason::NotIncluded => "Not included",
            FilterReason::ExcludedByPattern => "Excluded",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    Reject(FilterReason),
}

impl FilterDecision {
    pub fn excluded(self) -> bool {
        matches!(self, FilterDecision::Reject(_))
    }

    pub fn reason(self) -> Option<FilterReason> {
        match self {
            FilterDecision::Accept => None,
            FilterDecision::Reject(r) => Some(r),
        }
    }
}

/// Drops the first path segment, if there's more than one.
pub fn strip_first_segment(path: &str) -> &str {
    match path.split_once('/') {
        Some((_, rest)) => rest,
        None => path,
    }
}

/// The final segment of a path
fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// Case-insensitive subsequence test:
/// every character of `pattern` appears in `target`, in order.
pub fn fuzzy_match(pattern: &str, target: &str) -> bool {
    let mut target = target.chars().flat_map(char::to_lowercase);
    pattern
        .chars()
        .flat_map(char::to_lowercase)
        .all(|p| target.any(|t| t == p))
}

/// Adds a glob to the set, logging and skipping it if it doesn't parse.
fn add_glob(builder: &mut GlobSetBuilder, pattern: &str) -> bool {
    match GlobBuilder::new(pattern).literal_separator(true).build() {
        Ok(glob) => {
            builder.add(glob);
            true
        }
        Err(e) => {
            warn!("Skipping invalid pattern {pattern:?}: {e}");
            false
        }
    }
}

fn build_set(builder: GlobSetBuilder) -> GlobSet {
    builder.build().unwrap_or_else(|e| {
        warn!("Couldn't compile patterns: {e}");
        GlobSet::empty()
    })
}

/// One side (include or exclude) of the compiled filter
#[derive(Debug)]
struct PatternSet {
    /// Matched against the whole path
    normal: GlobSet,
    /// Matched against the last path segment
    basename: GlobSet,
    /// Lowercased plain patterns for subsequence matching
    fuzzy: Vec<String>,
}

impl PatternSet {
    fn empty() -> Self {
        Self {
            normal: GlobSet::empty(),
            basename: GlobSet::empty(),
            fuzzy: Vec::new(),
        }
    }

    fn compile<'a, I>(patterns: I, fuzzy: bool) -> Self
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut normal = GlobSetBuilder::new();
        let mut basename = GlobSetBuilder::new();
        let mut fuzzy_patterns = Vec::new();
        let mut seen = HashSet::new();

        for pattern in patterns {
            let pattern = pattern.trim().trim_start_matches('/');
            if pattern.is_empty() || !seen.insert(pattern) {
                continue;
            }
            if pattern.starts_with('*') && !pattern.contains('/') {
                add_glob(&mut basename, pattern);
            } else if is_glob(pattern) {
                add_glob(&mut normal, pattern);
            } else {
                // A plain name means "this, or anything under it".
                let pattern = pattern.trim_end_matches('/');
                add_glob(&mut normal, pattern);
                add_glob(&mut normal, &format!("{pattern}/**"));
                if fuzzy {
                    fuzzy_patterns.push(pattern.to_lowercase());
                }
            }
        }


        Self {
            normal: build_set(normal),
            basename: build_set(basename),
            fuzzy: fuzzy_patterns,
        }
    }

    fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.basename.is_empty() && self.fuzzy.is_empty()
    }

    fn is_match(&self, path: &str) -> bool {
        self.normal.is_match(path)
            || self.basename.is_match(basename(path))
            || self.fuzzy.iter().any(|p| fuzzy_match(p, path))
    }
}

/// A [`FilterConfiguration`] compiled for evaluating paths
#[derive(Debug)]
pub struct CompiledMatcherSet {
    /// Base paths padded as `/dir/`
    base_paths: Vec<String>,
    include: PatternSet,
    exclude: PatternSet,
    max_file_size: Option<u64>,
    omit_first_segment: bool,
    /// Reject binary extensions up front
    /// (only when we don't have a URL to reference them with instead).
    reject_binary_extensions: bool,
}

impl CompiledMatcherSet {
    pub fn compile(config: &FilterConfiguration) -> Self {
        let base_paths = config
            .base_paths
            .iter()
            .map(|b| b.trim_matches('/'))
            .filter(|b| !b.is_empty())
            .map(|b| format!("/{b}/"))
            .collect();

        let include = PatternSet::compile(&config.include_patterns, config.enable_fuzzy_matching);
        // `.genignore` lines join the exclusions as-is; duplicates collapse.
        let exclude = PatternSet::compile(
            config.exclude_patterns.iter().chain(&config.genignore_patterns),
            false,
        );

        let compiled = Self {
            base_paths,
            include,
            exclude,
            max_file_size: config.max_file_size,
            omit_first_segment: config.omit_first_segment,
            reject_binary_extensions: config.omit_binary && config.raw_url_prefix.is_none(),
        };
        debug!("Compiled filter: {:?}", compiled);
        compiled
    }

    /// A matcher set that accepts everything
    pub fn accept_all() -> Self {
        Self {
            base_paths: Vec::new(),
            include: PatternSet::empty(),
            exclude: PatternSet::empty(),
            max_file_size: None,
            omit_first_segment: false,
            reject_binary_extensions: false,
        }
    }

    /// The path as it's reported downstream
    pub fn output_path<'a>(&self, path: &'a str) -> &'a str {
        if self.omit_first_segment {
            strip_first_segment(path)
        } else {
            path
        }
    }

    /// True if `size` is over the configured maximum
    pub fn too_large(&self, size: u64) -> bool {
        self.max_file_size.is_some_and(|max| size > max)
    }

    /// Judges an entry by its archive path and declared size.
    ///
    /// The first failing check wins, in this order:
    /// size, binary extension, base path, inclusion, exclusion.
    pub fn evaluate(&self, path: &str, size: Option<u64>) -> FilterDecision {
        let path = self.output_path(path);

        if size.is_some_and(|s| self.too_large(s)) {
            return FilterDecision::Reject(FilterReason::TooLarge);
        }
        // Cheaper than any pattern.
        if self.reject_binary_extensions && has_binary_extension(path) {
            return FilterDecision::Reject(FilterReason::BinaryExtension);
        }
        if !self.base_paths.is_empty() {
            let padded = format!("/{}/", path.trim_matches('/'));
            if !self.base_paths.iter().any(|b| padded.starts_with(b.as_str())) {
                return FilterDecision::Reject(FilterReason::NoBasePathMatch);
            }
        }
        if !self.include.is_empty() && !self.include.is_match(path) {
            return FilterDecision::Reject(FilterReason::NotIncluded);
        }
        if self.exclude.is_match(path) {
            return FilterDecision::Reject(FilterReason::ExcludedByPattern);
        }
        FilterDecision::Accept
    }
}
