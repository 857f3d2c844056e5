//! A thin safe wrapper around PCRE2's partial-matching API.
//!
//! The `regex` crate has no equivalent of PCRE2_PARTIAL_HARD, and spec
//! §4.B's framing algorithm depends on it ("partial-hard matching"): a
//! match attempt against a prefix of the final input must distinguish "no
//! match is possible" from "no match yet, but more input could complete
//! one". We go straight to `pcre2-sys`'s raw bindings for this, the same
//! way the original service consumed a PCRE library rather than hand-rolling
//! an engine (spec Non-goals: "supplying a general regex engine").

use std::ffi::c_void;
use std::fmt;
use std::ptr;

use pcre2_sys::{
    pcre2_code_free_8, pcre2_compile_8, pcre2_get_ovector_pointer_8, pcre2_match_8,
    pcre2_match_data_create_from_pattern_8, pcre2_match_data_free_8, PCRE2_ERROR_NOMATCH,
    PCRE2_ERROR_PARTIAL, PCRE2_ANCHORED, PCRE2_MULTILINE, PCRE2_NOTEOF, PCRE2_PARTIAL_HARD,
};

#[derive(Debug)]
pub enum RegexError {
    /// PCRE2 compilation failed at `offset` with error code `code`.
    Compile { code: i32, offset: usize },
}

impl fmt::Display for RegexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegexError::Compile { code, offset } => {
                write!(f, "regex compilation failed at offset {offset} (pcre2 error {code})")
            }
        }
    }
}

impl std::error::Error for RegexError {}

/// One capture group's byte range within the subject, or `None` if the
/// group did not participate in the match.
pub type Capture = Option<(usize, usize)>;

pub enum MatchOutcome {
    /// A full match; `captures[0]` is the whole match, `captures[1..]` are
    /// the numbered capturing groups.
    Match { captures: Vec<Capture> },
    /// PCRE2_ERROR_PARTIAL: more input could still complete a match.
    Partial,
    /// No match is possible against this subject, even with more input.
    NoMatch,
    /// Any other PCRE2 error code, surfaced for the caller to close the
    /// connection (spec §4.B: "any other failure closes the connection").
    Error(i32),
}

/// A compiled, anchored, multiline PCRE2 pattern.
pub struct CompiledRegex {
    code: *mut pcre2_sys::pcre2_code_8,
    capture_count: u32,
}

// The compiled code is read-only after compilation; match_data is created
// fresh per call so concurrent use from a single thread (the only caller
// this library ever has, per its single-threaded cooperative event loops)
// is safe.
unsafe impl Send for CompiledRegex {}

impl CompiledRegex {
    /// Compile `pattern` anchored and multiline, as spec §4.B requires.
    pub fn compile(pattern: &[u8]) -> Result<Self, RegexError> {
        let mut error_code: i32 = 0;
        let mut error_offset: usize = 0;

        let options = PCRE2_ANCHORED | PCRE2_MULTILINE;

        let code = unsafe {
            pcre2_compile_8(
                pattern.as_ptr(),
                pattern.len(),
                options,
                &mut error_code,
                &mut error_offset,
                ptr::null_mut(),
            )
        };

        if code.is_null() {
            return Err(RegexError::Compile {
                code: error_code,
                offset: error_offset,
            });
        }

        let capture_count = unsafe { capture_count(code) };

        Ok(CompiledRegex {
            code,
            capture_count,
        })
    }

    /// Attempt a match anchored at `start` within `subject`. `not_eof`
    /// enables PCRE2_NOTEOF + PCRE2_PARTIAL_HARD semantics ("not end of
    /// input" partial-hard matching, spec §4.B): when the input so far
    /// could still grow into a match, this returns `Partial` instead of
    /// `NoMatch`. Callers pass `not_eof = false` on the final pass after
    /// EOF to force a definitive verdict.
    pub fn match_at(&self, subject: &[u8], start: usize, not_eof: bool) -> MatchOutcome {
        let match_data =
            unsafe { pcre2_match_data_create_from_pattern_8(self.code, ptr::null_mut()) };
        if match_data.is_null() {
            return MatchOutcome::Error(-1);
        }

        let mut options = 0u32;
        if not_eof {
            options |= PCRE2_NOTEOF | PCRE2_PARTIAL_HARD;
        }

        let rc = unsafe {
            pcre2_match_8(
                self.code,
                subject.as_ptr(),
                subject.len(),
                start,
                options,
                match_data,
                ptr::null_mut(),
            )
        };

        let outcome = if rc == PCRE2_ERROR_NOMATCH {
            MatchOutcome::NoMatch
        } else if rc == PCRE2_ERROR_PARTIAL {
            MatchOutcome::Partial
        } else if rc < 0 {
            MatchOutcome::Error(rc)
        } else {
            let ovector = unsafe { pcre2_get_ovector_pointer_8(match_data) };
            let pairs = (self.capture_count as usize + 1).max(rc.max(0) as usize);
            let mut captures = Vec::with_capacity(pairs);
            for i in 0..pairs {
                let a = unsafe { *ovector.add(2 * i) };
                let b = unsafe { *ovector.add(2 * i + 1) };
                const UNSET: usize = usize::MAX;
                if a == UNSET || b == UNSET {
                    captures.push(None);
                } else {
                    captures.push(Some((a, b)));
                }
            }
            MatchOutcome::Match { captures }
        };

        unsafe { pcre2_match_data_free_8(match_data) };
        outcome
    }
}

impl Drop for CompiledRegex {
    fn drop(&mut self) {
        unsafe { pcre2_code_free_8(self.code) };
    }
}

/// Query the number of capturing groups via `pcre2_pattern_info_8`.
unsafe fn capture_count(code: *const pcre2_sys::pcre2_code_8) -> u32 {
    let mut count: u32 = 0;
    pcre2_sys::pcre2_pattern_info_8(
        code,
        pcre2_sys::PCRE2_INFO_CAPTURECOUNT,
        &mut count as *mut u32 as *mut c_void,
    );
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_match_with_capture() {
        let re = CompiledRegex::compile(b"(.*)\n").unwrap();
        match re.match_at(b"hello\n", 0, false) {
            MatchOutcome::Match { captures } => {
                assert_eq!(captures[0], Some((0, 6)));
                assert_eq!(captures[1], Some((0, 5)));
            }
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn partial_when_input_could_still_complete() {
        let re = CompiledRegex::compile(b"(.*)\n").unwrap();
        match re.match_at(b"hello", 0, true) {
            MatchOutcome::Partial => {}
            other => panic!("expected partial, got {:?}", std::mem::discriminant(&other)),
        }
    }
}
