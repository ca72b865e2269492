// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
//! Reverse HTTP tunnels: a public relay pairs incoming HTTP clients with sockets that
//! exposing hosts keep open towards it, so local servers are reachable without inbound ports.

pub mod common;
pub mod expose;
pub mod relay;
pub mod util;

pub use common::version::VERSION;
pub use expose::{Expose, ExposeError, ExposeOptions};
pub use relay::{Relay, RelayError, RelayHandle, RelayOptions, RelayServices};
