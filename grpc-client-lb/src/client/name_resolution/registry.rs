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

use std::{collections::HashMap, sync::Arc, sync::LazyLock};

use parking_lot::Mutex;

use super::{PassthroughResolverBuilder, ResolverBuilder};

/// A registry to store and retrieve name resolvers.  Resolvers are indexed by
/// the URI scheme they are intended to handle.
#[derive(Default)]
pub struct ResolverRegistry {
    m: Mutex<HashMap<String, Arc<dyn ResolverBuilder>>>,
}

impl ResolverRegistry {
    /// Construct an empty name resolver registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a name resolver into the registry. builder.scheme() will
    /// be used as the scheme registered with this builder. If multiple
    /// resolvers are registered with the same scheme, the one registered last
    /// will take effect.  Schemes are case-insensitive.
    pub fn add_builder(&self, builder: impl ResolverBuilder + 'static) {
        let scheme = builder.scheme().to_ascii_lowercase();
        self.m.lock().insert(scheme, Arc::new(builder));
    }

    /// Returns the resolver builder registered for the given scheme, if any.
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.m.lock().get(&scheme.to_ascii_lowercase()).cloned()
    }
}

/// Global registry for resolver builders.  The passthrough resolver is
/// always registered.
pub static GLOBAL_RESOLVER_REGISTRY: LazyLock<ResolverRegistry> = LazyLock::new(|| {
    let registry = ResolverRegistry::new();
    registry.add_builder(PassthroughResolverBuilder);
    registry
});

#[cfg(test)]
mod tests {
    use super::{GLOBAL_RESOLVER_REGISTRY, ResolverRegistry};
    use crate::client::name_resolution::PassthroughResolverBuilder;

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = ResolverRegistry::new();
        assert!(registry.get("passthrough").is_none());
        registry.add_builder(PassthroughResolverBuilder);
        assert!(registry.get("PassThrough").is_some());
    }

    #[test]
    fn global_registry_has_passthrough() {
        assert!(GLOBAL_RESOLVER_REGISTRY.get("passthrough").is_some());
    }
}
