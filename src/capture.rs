//! Call-site capture for creation context
//!
//! When the tracker records a newly created resource it captures up to
//! `max_frames` frames of the creating call site, with the instrumentation
//! machinery's own frames stripped from the front. The result is a
//! best-effort diagnostic, not a guaranteed-clean trace: symbol resolution
//! depends on the build, and the noise list is a fixed set of known
//! machinery prefixes.
//!
//! The noise decision lives in exactly one place ([`filter_frames`] via its
//! prefix list), and `max_frames` is the only knob: the default is
//! [`DEFAULT_MAX_FRAMES`], and `0` disables capture entirely without paying
//! for a backtrace.

use std::fmt;

use backtrace::Backtrace;

/// Default number of caller frames kept per creation.
pub const DEFAULT_MAX_FRAMES: usize = 20;

/// One resolved call-site frame.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Frame {
    /// Demangled function path, or `"<unresolved>"` when symbols are absent.
    pub function: String,
    /// Source file, when debug info is available.
    pub file: Option<String>,
    /// Line number, when debug info is available.
    pub line: Option<u32>,
}

impl Frame {
    /// A frame with only a function name, no file or line.
    pub fn named(function: impl Into<String>) -> Self {
        Frame {
            function: function.into(),
            file: None,
            line: None,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at {}", self.function)?;
        if let Some(file) = &self.file {
            write!(f, " ({file}")?;
            if let Some(line) = self.line {
                write!(f, ":{line}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Captures filtered call-site frames for creation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFilter {
    max_frames: usize,
}

impl CaptureFilter {
    /// A filter keeping up to `max_frames` caller frames. `0` disables
    /// capture.
    pub fn new(max_frames: usize) -> Self {
        CaptureFilter { max_frames }
    }

    /// The configured frame limit.
    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Capture the current thread's call site, outermost caller first.
    ///
    /// Returns an empty sequence when capture is disabled or when no genuine
    /// caller frames can be resolved; never errors.
    pub fn capture(&self) -> Vec<Frame> {
        if self.max_frames == 0 {
            return Vec::new();
        }
        let backtrace = Backtrace::new();
        let frames = backtrace
            .frames()
            .iter()
            .flat_map(|frame| frame.symbols())
            .map(|symbol| Frame {
                function: symbol
                    .name()
                    .map(|name| name.to_string())
                    .unwrap_or_else(|| String::from("<unresolved>")),
                file: symbol.filename().map(|path| path.display().to_string()),
                line: symbol.lineno(),
            })
            .collect();
        filter_frames(frames, self.max_frames)
    }
}

impl Default for CaptureFilter {
    fn default() -> Self {
        CaptureFilter::new(DEFAULT_MAX_FRAMES)
    }
}

/// Machinery whose frames precede the genuine caller and carry no
/// diagnostic value. Matched by substring because trait-impl symbols render
/// as `<Type as Trait>::method`.
const MACHINERY: &[&str] = &[
    "spillway::capture",
    "spillway::tracker",
    "spillway::sink",
    "spillway::intercept",
    "backtrace::",
    "core::ops::function",
];

fn is_machinery(function: &str) -> bool {
    MACHINERY.iter().any(|noise| function.contains(noise))
}

/// Drop leading machinery frames, then keep up to `max` of the rest.
///
/// Only the *leading* run is stripped: once a genuine caller frame appears,
/// everything after it is kept verbatim, even if a later frame happens to
/// match the noise list. Fewer genuine frames than requested is not an
/// error; whatever exists is returned.
pub(crate) fn filter_frames(frames: Vec<Frame>, max: usize) -> Vec<Frame> {
    frames
        .into_iter()
        .skip_while(|frame| is_machinery(&frame.function))
        .take(max)
        .collect()
}
