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

#![deny(missing_docs, rust_2018_idioms, unused_imports)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! kvikk is a concurrent HTTP/1.1 server built around a single-threaded
//! I/O reactor and a fixed pool of worker threads.
//!
//! The reactor accepts connections, arms edge-triggered readiness for each
//! client socket, and hands readiness to workers as tagged tasks over a
//! bounded queue. A sorted timer list culls connections idle for three
//! alarm periods, with the alarm delivered through the poll set via a
//! signal pipe. Logging flows through a multi-buffer ring drained by a
//! background thread, and request processing can lease pre-authenticated
//! MySQL handles from a bounded pool.

pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod logger;
pub mod parser;
pub mod reactor;
pub mod threadpool;
pub mod timer;
pub mod worker;
