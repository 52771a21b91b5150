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

//! Incremental HTTP/1.1 request parsing and response status model.

use std::fmt::Display;

pub mod request;
pub mod response;

/// Request methods the server accepts.
///
/// Anything else on the request line is rejected with `400 Bad Request`
/// before header parsing begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Static resource fetch.
    Get,
    /// Form submission (login/register) with a buffered body.
    Post,
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
        })
    }
}

/// Result of scanning the read buffer for one `\r\n`-terminated line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineStatus {
    /// A complete line is available.
    Ok,
    /// A bare `\r` or `\n` appeared where the terminator could not fit.
    Bad,
    /// The terminator has not arrived yet.
    Open,
}
