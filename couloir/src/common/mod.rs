// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
//! Building blocks shared by the relay and the exposing host

pub mod control_api;
pub mod http;
pub mod id;
pub mod pipe;
pub mod protocol;
pub mod quota;
pub mod tls;
pub mod version;
