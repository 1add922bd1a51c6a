//! # [`Runtime`] Module
//!
//! The `Runtime` owns every long-lived task of a murmur node. Work is expressed
//! as actors: plain actors react to commands, recurrent actors additionally
//! fire on a fixed interval, and stream actors are driven by an arbitrary
//! [`Stream`] (the deadline stream of the event scheduler, for instance).
//!
//! Every actor is registered under an identifier and can be destroyed
//! individually or all at once. Destruction waits for the actor task to
//! finish, so a node that shuts down has no task left behind.

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{Stream, StreamExt};
use runtime_metrics::METRICS;
use pin_project::pin_project;
use std::fmt::Debug;
use std::hash::Hash;
use std::pin::{pin, Pin};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, warn};

mod runtime_metrics;

/// [`ActorCommand`] marks the command type an actor reacts to. Different
/// runtimes pick their own command enums.
pub trait ActorCommand: Send + 'static {}

/// Handler invoked by plain and recurrent actors. `None` means the call was
/// triggered by the actor's interval rather than by a command.
pub type CommandHandler<C> = Box<dyn Fn(Option<C>) -> BoxFuture<'static, ()> + Send + Sync>;

/// [`RuntimeConfig`] runtime configuration
pub struct RuntimeConfig {
    enable_metrics: bool,
    shutdown_duration: Duration,
}

/// Book-keeping for a spawned actor.
struct ActorHandle<C> {
    commands: mpsc::UnboundedSender<C>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// [`Runtime`] main entry point. It stores every spawned actor and tears them
/// down on request.
pub struct Runtime<T, C>
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
    C: ActorCommand,
{
    actors: DashMap<T, ActorHandle<C>>,
    config: RuntimeConfig,
}

/// [`RecurrentActor`] yields once per interval tick.
#[pin_project]
struct RecurrentActor {
    #[pin]
    interval: tokio::time::Interval,
}

impl Stream for RecurrentActor {
    type Item = ();

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        match this.interval.poll_tick(cx) {
            Poll::Ready(_) => Poll::Ready(Some(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// [`RuntimeBuilder`] represents runtime configuration builder.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    /// Creates a new [`RuntimeBuilder`] to configure and build a Runtime.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let runtime = Runtime::builder()
    ///     .with_metrics_enabled(true)
    ///     .build::<ActorId, Command>();
    /// ```
    fn new() -> Self {
        Self {
            config: RuntimeConfig {
                enable_metrics: false,
                shutdown_duration: Duration::from_millis(10_000),
            },
        }
    }

    /// Enables or disables metrics collection.
    pub fn with_metrics_enabled(mut self, enable_metrics: bool) -> Self {
        self.config.enable_metrics = enable_metrics;
        self
    }

    /// Sets the maximum time to wait for a single actor to stop.
    pub fn with_shutdown_duration(mut self, shutdown_duration: Duration) -> Self {
        self.config.shutdown_duration = shutdown_duration;
        self
    }

    /// Builds the Runtime with the configured settings.
    pub fn build<T, C>(self) -> Arc<Runtime<T, C>>
    where
        T: Hash + Eq + Clone + Send + Sync + 'static,
        C: ActorCommand,
    {
        Arc::new(Runtime {
            actors: DashMap::new(),
            config: self.config,
        })
    }
}

/// [`RuntimeExt`] represents runtime trait
#[async_trait::async_trait]
pub trait RuntimeExt<T, C>: Send + Sync + 'static
where
    T: Hash + Eq + Clone + Send + Sync + 'static,
    C: ActorCommand,
{
    /// Send a command to an actor.
    async fn send_command(&self, actor_id: &T, command: C) -> Result<()>;

    /// Spawn an actor that only reacts to commands.
    async fn spawn_actor<F>(&self, actor_id: T, command_handler: F) -> Result<()>
    where
        F: Fn(Option<C>) -> BoxFuture<'static, ()> + Send + Sync + 'static;

    /// Spawn an actor that also runs its handler every `period`.
    async fn spawn_recurrent_actor<F>(&self, actor_id: T, period: Duration, command_handler: F) -> Result<()>
    where
        F: Fn(Option<C>) -> BoxFuture<'static, ()> + Send + Sync + 'static;

    /// Spawn an actor whose commands come from `stream`. The actor stops when
    /// the stream ends or when it is destroyed.
    async fn spawn_actor_on_stream<S, F>(&self, actor_id: T, stream: S, command_handler: F) -> Result<()>
    where
        S: Stream<Item = C> + Send + 'static,
        F: Fn(C) -> BoxFuture<'static, ()> + Send + Sync + 'static;

    /// Destroy a spawned actor by its ID and wait for it to stop.
    async fn destroy_actor(&self, actor_id: &T) -> Result<()>;

    /// Destroy every actor.
    async fn destroy(&self) -> Result<()>;
}

impl<T, C> Runtime<T, C>
where
    T: Hash + Debug + Eq + Clone + Send + Sync + 'static,
    C: ActorCommand,
{
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Number of registered actors.
    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    /// Whether an actor with `actor_id` is registered.
    pub fn contains_actor(&self, actor_id: &T) -> bool {
        self.actors.contains_key(actor_id)
    }

    fn register(&self, actor_id: T, handle: ActorHandle<C>) -> Result<()> {
        if self.actors.contains_key(&actor_id) {
            handle.task.abort();
            return Err(anyhow!("actor {:?} already exists", actor_id));
        }
        if self.config.enable_metrics {
            METRICS.total_actors.increment(1.0);
        }
        self.actors.insert(actor_id, handle);
        Ok(())
    }

    async fn run_handler(handler: &CommandHandler<C>, command: Option<C>, metrics_enabled: bool) {
        let start = Instant::now();
        handler(command).await;
        if metrics_enabled {
            METRICS.actor_command_throughput.increment(1);
            METRICS.actor_command_latency.record(start.elapsed().as_secs_f64());
        }
    }

    /// Main loop of a recurrent actor: commands and interval ticks are
    /// processed one at a time, so a slow handler delays the next tick
    /// instead of overlapping with it.
    async fn run_recurrent_actor(
        actor_id: T,
        handler: CommandHandler<C>,
        period: Duration,
        mut commands: mpsc::UnboundedReceiver<C>,
        mut shutdown_rx: broadcast::Receiver<()>,
        metrics_enabled: bool,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = pin!(RecurrentActor { interval: ticker });

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                Some(command) = commands.recv() => {
                    Self::run_handler(&handler, Some(command), metrics_enabled).await;
                }
                Some(()) = ticks.next() => {
                    Self::run_handler(&handler, None, metrics_enabled).await;
                }
            }
        }
        debug!("recurrent actor {:?} stopped", actor_id);
    }

    async fn run_actor(
        actor_id: T,
        handler: CommandHandler<C>,
        mut commands: mpsc::UnboundedReceiver<C>,
        mut shutdown_rx: broadcast::Receiver<()>,
        metrics_enabled: bool,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                command = commands.recv() => match command {
                    Some(command) => Self::run_handler(&handler, Some(command), metrics_enabled).await,
                    None => break,
                },
            }
        }
        debug!("actor {:?} stopped", actor_id);
    }
}

#[async_trait::async_trait]
impl<T, C> RuntimeExt<T, C> for Runtime<T, C>
where
    T: Hash + Eq + Debug + Clone + Send + Sync + 'static,
    C: ActorCommand,
{
    /// Sends a command to a specific actor.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// runtime.send_command(&ActorId::Probe, Command::ProbeNow).await?;
    /// ```
    async fn send_command(&self, actor_id: &T, command: C) -> Result<()> {
        let result = match self.actors.get(actor_id) {
            Some(actor) => actor
                .commands
                .send(command)
                .map_err(|_| anyhow!("actor {:?} is not accepting commands", actor_id)),
            None => Err(anyhow!("actor {:?} not found", actor_id)),
        };

        if result.is_err() && self.config.enable_metrics {
            METRICS.error_rate.increment(1);
        }
        result
    }

    async fn spawn_actor<F>(&self, actor_id: T, command_handler: F) -> Result<()>
    where
        F: Fn(Option<C>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(Self::run_actor(
            actor_id.clone(),
            Box::new(command_handler),
            receiver,
            shutdown_rx,
            self.config.enable_metrics,
        ));

        self.register(actor_id, ActorHandle { commands, shutdown, task })
    }

    /// Spawns a new recurrent actor that executes periodically.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// runtime.spawn_recurrent_actor(ActorId::Gossip, Duration::from_millis(200), move |_| {
    ///     Box::pin(async move { /* periodic work */ })
    /// }).await?;
    /// ```
    async fn spawn_recurrent_actor<F>(&self, actor_id: T, period: Duration, command_handler: F) -> Result<()>
    where
        F: Fn(Option<C>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(anyhow!("recurrent actor {:?} needs a non-zero period", actor_id));
        }
        let (commands, receiver) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(Self::run_recurrent_actor(
            actor_id.clone(),
            Box::new(command_handler),
            period,
            receiver,
            shutdown_rx,
            self.config.enable_metrics,
        ));

        self.register(actor_id, ActorHandle { commands, shutdown, task })
    }

    async fn spawn_actor_on_stream<S, F>(&self, actor_id: T, stream: S, command_handler: F) -> Result<()>
    where
        S: Stream<Item = C> + Send + 'static,
        F: Fn(C) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        // Commands sent through `send_command` are merged with the stream.
        let (commands, mut receiver) = mpsc::unbounded_channel::<C>();
        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let metrics_enabled = self.config.enable_metrics;
        let id = actor_id.clone();

        let task = tokio::spawn(async move {
            let mut stream = pin!(stream);
            loop {
                let command = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    Some(command) = receiver.recv() => command,
                    next = stream.next() => match next {
                        Some(command) => command,
                        None => break,
                    },
                };
                let start = Instant::now();
                command_handler(command).await;
                if metrics_enabled {
                    METRICS.actor_command_throughput.increment(1);
                    METRICS.actor_command_latency.record(start.elapsed().as_secs_f64());
                }
            }
            debug!("stream actor {:?} stopped", id);
        });

        self.register(actor_id, ActorHandle { commands, shutdown, task })
    }

    /// Destroys a spawned actor by its ID, waiting at most the configured
    /// shutdown duration before aborting its task.
    async fn destroy_actor(&self, actor_id: &T) -> Result<()> {
        let Some((_, handle)) = self.actors.remove(actor_id) else {
            return Ok(());
        };
        if self.config.enable_metrics {
            METRICS.total_actors.decrement(1.0);
        }

        // A send error only means the actor already exited.
        let _ = handle.shutdown.send(());
        let mut task = handle.task;
        match tokio::time::timeout(self.config.shutdown_duration, &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_cancelled() => Ok(()),
            Ok(Err(e)) => Err(anyhow!("actor {:?} panicked: {}", actor_id, e)),
            Err(_) => {
                warn!("actor {:?} did not stop within {:?}, aborting", actor_id, self.config.shutdown_duration);
                task.abort();
                Ok(())
            }
        }
    }

    /// Destroys the entire runtime, shutting down all actors.
    async fn destroy(&self) -> Result<()> {
        let actor_ids: Vec<T> = self.actors.iter().map(|entry| entry.key().clone()).collect();
        for actor_id in actor_ids {
            if let Err(e) = self.destroy_actor(&actor_id).await {
                error!("Error destroying actor {:?}: {}", actor_id, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Hash, Eq, PartialEq, Debug)]
    enum MockActorId {
        Ticker,
        Worker,
        Stream,
    }

    #[derive(Debug)]
    struct MockCommand(usize);

    impl ActorCommand for MockCommand {}

    type MockRuntime = Runtime<MockActorId, MockCommand>;

    #[tokio::test]
    async fn test_recurrent_actor_ticks_until_destroyed() {
        let runtime = MockRuntime::builder().with_metrics_enabled(true).build::<MockActorId, MockCommand>();
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();

        runtime
            .spawn_recurrent_actor(MockActorId::Ticker, Duration::from_millis(10), move |command| {
                let ticks = ticks_clone.clone();
                Box::pin(async move {
                    if command.is_none() {
                        ticks.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        runtime.destroy().await.unwrap();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected several ticks, got {}", seen);
        assert_eq!(runtime.actor_count(), 0);

        // No tick may happen once destroy has returned.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_send_command_to_actor() {
        let runtime = MockRuntime::builder().build::<MockActorId, MockCommand>();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();

        runtime
            .spawn_actor(MockActorId::Worker, move |command| {
                let received = received_clone.clone();
                Box::pin(async move {
                    if let Some(MockCommand(n)) = command {
                        received.lock().push(n);
                    }
                })
            })
            .await
            .unwrap();

        runtime.send_command(&MockActorId::Worker, MockCommand(7)).await.unwrap();
        runtime.send_command(&MockActorId::Worker, MockCommand(8)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*received.lock(), vec![7, 8]);

        assert!(runtime.send_command(&MockActorId::Ticker, MockCommand(1)).await.is_err());
        runtime.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_actor_consumes_stream() {
        let runtime = MockRuntime::builder().build::<MockActorId, MockCommand>();
        let sum = Arc::new(AtomicUsize::new(0));
        let sum_clone = sum.clone();
        let stream = futures::stream::iter((1..=4).map(MockCommand));

        runtime
            .spawn_actor_on_stream(MockActorId::Stream, stream, move |MockCommand(n)| {
                let sum = sum_clone.clone();
                Box::pin(async move {
                    sum.fetch_add(n, Ordering::SeqCst);
                })
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sum.load(Ordering::SeqCst), 10);
        runtime.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_actor_is_rejected() {
        let runtime = MockRuntime::builder().build::<MockActorId, MockCommand>();
        let noop = |_: Option<MockCommand>| -> BoxFuture<'static, ()> { Box::pin(async {}) };
        runtime.spawn_actor(MockActorId::Worker, noop).await.unwrap();
        assert!(runtime.spawn_actor(MockActorId::Worker, noop).await.is_err());
        assert!(runtime.contains_actor(&MockActorId::Worker));
        runtime.destroy().await.unwrap();
    }
}
