use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::event::Event;
use crate::output::OutputRuntime;
use crate::source::RouteSpec;

/// Maps a source's declared route(s) to the output(s) registered under
/// that name (§4.5). A route name with nothing registered is logged
/// and dropped for that name only — other routes on the same event
/// still get their copy.
#[derive(Default)]
pub struct Router {
    routes: HashMap<Option<String>, Vec<Arc<OutputRuntime>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: Option<String>, output: Arc<OutputRuntime>) {
        self.routes.entry(name).or_default().push(output);
    }

    /// Dispatches one source's batch to every output registered under
    /// each of its route names. Events are not cloned per output target
    /// beyond what's required to hand each output its own owned copy —
    /// callers must still treat them as read-only once sent.
    pub async fn dispatch(&self, route: &RouteSpec, events: Vec<Event>) {
        let names = route.names();
        if names.len() == 1 {
            self.dispatch_one(&names[0], events).await;
            return;
        }

        for name in names {
            self.dispatch_one(&name, events.clone()).await;
        }
    }

    async fn dispatch_one(&self, name: &Option<String>, events: Vec<Event>) {
        match self.routes.get(name) {
            None => {
                warn!(route = ?name, "no outputs registered for route; dropping batch");
            }
            Some(outputs) => {
                for output in outputs {
                    output.enqueue(events.clone()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::output::{OutputRuntime, OutputSettings};
    use crate::transport::NullTransport;

    async fn output() -> Arc<OutputRuntime> {
        Arc::new(OutputRuntime::new(
            OutputSettings { max_size: 100, ..OutputSettings::default() },
            Arc::new(NullTransport::default()),
        ))
    }

    #[tokio::test]
    async fn routing_s3() {
        let mut router = Router::new();
        let a = output().await;
        let b = output().await;
        router.register(Some("a".into()), a.clone());
        router.register(Some("b".into()), b.clone());

        router
            .dispatch(&RouteSpec::One(Some("a".into())), vec![Event::metric("x", "h", 1.0)])
            .await;
        assert_eq!(a.queue_len().await, 1);
        assert_eq!(b.queue_len().await, 0);

        router
            .dispatch(
                &RouteSpec::Many(vec![Some("a".into()), Some("b".into())]),
                vec![Event::metric("x", "h", 1.0)],
            )
            .await;
        assert_eq!(a.queue_len().await, 2);
        assert_eq!(b.queue_len().await, 1);
    }

    #[tokio::test]
    async fn unregistered_route_drops_silently() {
        let router = Router::new();
        router
            .dispatch(&RouteSpec::One(Some("missing".into())), vec![Event::metric("x", "h", 1.0)])
            .await;
    }
}
