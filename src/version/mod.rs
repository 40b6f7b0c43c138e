// src/version/mod.rs

//! Lenient comparison of dotted version strings
//!
//! Version names reported by the package manager are free-form and sometimes
//! lose their letter suffixes on the way back (a build installed as
//! `1.2.3-beta` may be reported as `1.2.3`). Everything here therefore works
//! on the *digit projection* of a version: the string with every character
//! other than ASCII digits and `.` removed.
//!
//! Two notions of sameness exist and they are not interchangeable:
//!
//! - [`compare_versions`] orders versions numerically, segment by segment.
//! - [`versions_equal_ignoring_letters`] is a textual match of the
//!   projections. It is stricter (`"1..2"` and `"1.5.2"` compare equal
//!   numerically because of the empty segment, but never match textually)
//!   and is what skip/removal decisions use.

use std::cmp::Ordering;

/// Version value meaning "any installed version is acceptable"
pub const ANY_VERSION: &str = "0";

/// Strip everything except digits and dots
pub fn digit_projection(version: &str) -> String {
    version
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect()
}

/// Split a projection into segments, ignoring trailing empty ones
fn segments(projection: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = projection.split('.').collect();
    while parts.len() > 1 && parts.last().is_some_and(|p| p.is_empty()) {
        parts.pop();
    }
    parts
}

/// Compare two version strings numerically
///
/// Segments are compared left to right and the first unequal pair decides.
/// When all shared segments are equal the version with more segments is
/// greater. A segment that is not a number after projection (empty, or too
/// large for `u64`) makes the comparison report [`Ordering::Equal`].
pub fn compare_versions(v1: &str, v2: &str) -> Ordering {
    let p1 = digit_projection(v1);
    let p2 = digit_projection(v2);
    let s1 = segments(&p1);
    let s2 = segments(&p2);

    for (a, b) in s1.iter().zip(s2.iter()) {
        let (Ok(n1), Ok(n2)) = (a.parse::<u64>(), b.parse::<u64>()) else {
            return Ordering::Equal;
        };
        match n1.cmp(&n2) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    s1.len().cmp(&s2.len())
}

/// Integer form of [`compare_versions`]: -1, 0 or 1
pub fn compare(v1: &str, v2: &str) -> i32 {
    match compare_versions(v1, v2) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

/// True when the digit projections of both versions are identical
pub fn versions_equal_ignoring_letters(v1: &str, v2: &str) -> bool {
    digit_projection(v1) == digit_projection(v2)
}

/// True when the requested version accepts anything
pub fn is_any_version(version: &str) -> bool {
    version == ANY_VERSION
}
