// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Response status lines and canned error bodies.

use std::fmt::Display;

/// The status codes this server emits.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Request resolved to a servable file.
    Ok = 200,
    /// The request could not be parsed or targets something unservable.
    BadRequest = 400,
    /// The target exists but is not world-readable, or escapes the root.
    Forbidden = 403,
    /// The target does not exist under the document root.
    NotFound = 404,
    /// Mapping or response assembly failed.
    InternalError = 500,
}

impl Status {
    /// Numeric status code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Reason phrase for the status line.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::InternalError => "Internal Error",
        }
    }

    /// Short HTML body sent when no file backs the response.
    pub fn body(self) -> &'static str {
        match self {
            Self::Ok => "",
            Self::BadRequest => {
                "Your request has bad syntax or is inherently impossible to satisfy.\n"
            }
            Self::Forbidden => "You do not have permission to get file from this server.\n",
            Self::NotFound => "The requested file was not found on this server.\n",
            Self::InternalError => "There was an unusual problem serving the requested file.\n",
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{} {}", self.code(), self.reason()))
    }
}
