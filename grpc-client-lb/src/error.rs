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

//! Error types for the client connection management core.

use thiserror::Error;

/// Errors surfaced synchronously by the connection management core.
///
/// Failures that affect RPCs (resolution errors, connection failures) are not
/// reported through this type; they are carried to callers as a
/// [`tonic::Status`] by the published picker.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation is not supported by the receiving component.  This
    /// always indicates an integration bug rather than a transient condition.
    #[error("{operation} not supported on {component}")]
    Unsupported {
        operation: &'static str,
        component: &'static str,
    },

    #[error("invalid backoff config: {0}")]
    InvalidBackoffConfig(&'static str),

    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("no resolver registered for scheme {0:?}")]
    UnknownScheme(String),

    #[error("invalid service config: {0}")]
    InvalidServiceConfig(String),

    #[error("subchannel for {0} is not ready")]
    SubchannelNotReady(String),

    #[error("invalid call request: {0}")]
    InvalidRequest(#[from] http::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no transport connector configured")]
    MissingConnector,
}
