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

//! A resolver that hands the target's path straight to the LB policy as a
//! single address, e.g. `passthrough:///10.0.0.1:50051`.

use tonic::Status;

use super::{
    Address, Resolver, ResolverBuilder, ResolverListener, ResolverOptions, Target,
};

pub(crate) static SCHEME: &str = "passthrough";

pub struct PassthroughResolverBuilder;

impl ResolverBuilder for PassthroughResolverBuilder {
    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
        let path = target.path();
        let address = path.strip_prefix('/').unwrap_or(path).to_string();
        Box::new(PassthroughResolver {
            address,
            listener: options.listener,
        })
    }

    fn scheme(&self) -> &str {
        SCHEME
    }
}

struct PassthroughResolver {
    address: String,
    listener: ResolverListener,
}

impl Resolver for PassthroughResolver {
    fn update_resolution(&mut self) {
        if self.address.is_empty() {
            self.listener
                .on_error(Status::unavailable("passthrough target has no address"));
            return;
        }
        self.listener
            .on_successful_resolution(vec![Address::tcp(self.address.clone())], None, None);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tonic::Code;

    use super::PassthroughResolverBuilder;
    use crate::client::channel::WorkItem;
    use crate::client::name_resolution::{
        Address, ResolutionResult, ResolverBuilder, ResolverListener, ResolverOptions,
    };
    use crate::rt::default_runtime;

    fn build(target: &str) -> (Box<dyn super::Resolver>, mpsc::UnboundedReceiver<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = ResolverOptions {
            authority: String::new(),
            runtime: default_runtime(),
            listener: ResolverListener::new(tx),
        };
        let resolver = PassthroughResolverBuilder.build(&target.parse().unwrap(), options);
        (resolver, rx)
    }

    #[tokio::test]
    async fn reports_path_as_single_address() {
        let (mut resolver, mut rx) = build("passthrough:///localhost:50051");
        assert!(rx.try_recv().is_err(), "resolved before being asked to");
        resolver.update_resolution();
        match rx.recv().await.unwrap() {
            WorkItem::Resolution(ResolutionResult::Success {
                addresses,
                service_config,
                service_config_error,
            }) => {
                assert_eq!(addresses, vec![Address::tcp("localhost:50051")]);
                assert!(service_config.is_none());
                assert!(service_config_error.is_none());
            }
            other => panic!("unexpected work item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_path_is_an_error() {
        let (mut resolver, mut rx) = build("passthrough:///");
        resolver.update_resolution();
        match rx.recv().await.unwrap() {
            WorkItem::Resolution(ResolutionResult::Error(status)) => {
                assert_eq!(status.code(), Code::Unavailable);
            }
            other => panic!("unexpected work item: {other:?}"),
        }
    }
}
