// Copyright 2025 the eventide authors
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

pub(crate) mod acceptor;
pub(crate) mod command;
pub(crate) mod error;
mod event_loop;
mod logging;
mod loop_group;
mod server;
mod shutdown;

pub use error::{ServerError, ServerResult};
pub use logging::init_tracing;
pub use server::{serve, Options};
