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

//! Client-side connection management for [gRPC].
//!
//! This crate turns a channel target into a live, load-balanced set of
//! connections.  A [`client::Channel`] owns a resolving load balancer which
//! drives a name [resolver](client::name_resolution::Resolver), instantiates
//! the [LB policy](client::load_balancing::LbPolicy) selected by the service
//! config, and republishes a single connectivity state and picker.  Policies
//! create [subchannels](client::Subchannel), each of which owns one transport
//! session and its keepalive pings.
//!
//! The transport itself, payload codecs and credentials are supplied by the
//! embedder through [`client::transport::Connector`].
//!
//! [gRPC]: https://grpc.io

pub mod client;
mod error;
pub mod rt;

pub use error::Error;
