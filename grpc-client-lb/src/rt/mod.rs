/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

//! Runtime abstraction used for every background task and timer.
//!
//! Components never reach for an ambient executor or timer wheel; they are
//! handed an `Arc<dyn Runtime>` by whoever constructs them.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

#[cfg(feature = "_runtime-tokio")]
pub mod tokio;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

pub type BoxedTaskHandle = Box<dyn TaskHandle>;

/// An abstraction over an asynchronous runtime.
///
/// The `Runtime` trait defines the core functionality required for
/// executing asynchronous tasks and performing time-based operations such as
/// sleeping. It provides a uniform interface that can be implemented for
/// various async runtimes, enabling pluggable and testable infrastructure.
pub trait Runtime: Send + Sync {
    /// Spawns the given asynchronous task to run in the background.
    fn spawn(&self, task: BoxFuture<()>) -> BoxedTaskHandle;

    /// Returns a future that completes after the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>>;
}

/// A future that resolves after a specified duration.
pub trait Sleep: Send + Sync + Future<Output = ()> {}

pub trait TaskHandle: Send + Sync {
    /// Abort the associated task.
    fn abort(&self);
}

/// Returns the runtime used when a channel is not configured with one.
pub fn default_runtime() -> Arc<dyn Runtime> {
    #[cfg(feature = "_runtime-tokio")]
    {
        Arc::new(self::tokio::TokioRuntime::default())
    }
    #[cfg(not(feature = "_runtime-tokio"))]
    {
        compile_error!("a runtime feature must be enabled")
    }
}
