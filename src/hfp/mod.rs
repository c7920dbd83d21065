// Copyright 2026 Daniel Pelikan
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

//! Hands-Free Profile engine.
//!
//! Each accepted RFCOMM channel gets a connection actor running the AT
//! session; [`HfpEngine`] keeps the per-device table and exposes call
//! control.

pub mod at;
pub mod connection;
pub mod engine;
pub mod features;
pub mod indicators;
pub mod profile;
pub mod queue;
pub mod session;
pub mod slc;

pub use at::CurrentCall;
pub use engine::HfpEngine;
pub use indicators::CallState;
