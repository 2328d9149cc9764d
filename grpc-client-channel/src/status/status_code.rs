/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::fmt;
use std::str::FromStr;

/// Represents a gRPC status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

const NAMES: [(&str, StatusCode); 17] = [
    ("OK", StatusCode::Ok),
    ("CANCELLED", StatusCode::Cancelled),
    ("UNKNOWN", StatusCode::Unknown),
    ("INVALID_ARGUMENT", StatusCode::InvalidArgument),
    ("DEADLINE_EXCEEDED", StatusCode::DeadlineExceeded),
    ("NOT_FOUND", StatusCode::NotFound),
    ("ALREADY_EXISTS", StatusCode::AlreadyExists),
    ("PERMISSION_DENIED", StatusCode::PermissionDenied),
    ("RESOURCE_EXHAUSTED", StatusCode::ResourceExhausted),
    ("FAILED_PRECONDITION", StatusCode::FailedPrecondition),
    ("ABORTED", StatusCode::Aborted),
    ("OUT_OF_RANGE", StatusCode::OutOfRange),
    ("UNIMPLEMENTED", StatusCode::Unimplemented),
    ("INTERNAL", StatusCode::Internal),
    ("UNAVAILABLE", StatusCode::Unavailable),
    ("DATA_LOSS", StatusCode::DataLoss),
    ("UNAUTHENTICATED", StatusCode::Unauthenticated),
];

impl StatusCode {
    /// Returns the canonical upper snake case name of the code, as used in
    /// service config documents.
    pub fn name(self) -> &'static str {
        NAMES[self as usize].0
    }
}

impl From<i32> for StatusCode {
    fn from(i: i32) -> Self {
        match i {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            2 => StatusCode::Unknown,
            3 => StatusCode::InvalidArgument,
            4 => StatusCode::DeadlineExceeded,
            5 => StatusCode::NotFound,
            6 => StatusCode::AlreadyExists,
            7 => StatusCode::PermissionDenied,
            8 => StatusCode::ResourceExhausted,
            9 => StatusCode::FailedPrecondition,
            10 => StatusCode::Aborted,
            11 => StatusCode::OutOfRange,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            15 => StatusCode::DataLoss,
            16 => StatusCode::Unauthenticated,
            _ => StatusCode::Unknown,
        }
    }
}

impl FromStr for StatusCode {
    type Err = String;

    /// Parses a code from its name (e.g. "UNAVAILABLE").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NAMES
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, code)| *code)
            .ok_or_else(|| format!("unknown status code name {s:?}"))
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_from_i32() {
        assert_eq!(StatusCode::from(14), StatusCode::Unavailable);
        assert_eq!(StatusCode::from(0), StatusCode::Ok);
        assert_eq!(StatusCode::from(99), StatusCode::Unknown);
    }

    #[test]
    fn status_code_names() {
        assert_eq!(
            "RESOURCE_EXHAUSTED".parse::<StatusCode>(),
            Ok(StatusCode::ResourceExhausted)
        );
        assert_eq!(StatusCode::DeadlineExceeded.name(), "DEADLINE_EXCEEDED");
        assert!("unavailable".parse::<StatusCode>().is_err());
    }
}
