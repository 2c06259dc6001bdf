use anyhow::{anyhow, Result};
use chrono::{Duration as ChronoDuration, Utc};
use promo_gate::error::{ChannelError, EngineError};
use promo_gate::model::{Audience, Notification, NotificationDelivery, Tier};
use promo_gate::notify::{
    DeliveryChannel, MarkReadOutcome, PendingState, PushChannel, PushCommand, PushEvent,
    PushLink, Reconciler,
};
use promo_gate::portal::NotificationApi;
use promo_gate::ViewerContext;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify};

fn delivery(id: &str, audience: Audience) -> NotificationDelivery {
    NotificationDelivery {
        notification: Notification {
            id: id.into(),
            title: format!("notification {id}"),
            message: None,
            link_url: None,
            is_active: true,
            audience,
            start_date_time: None,
            end_date_time: None,
        },
        is_read: false,
        read_at: None,
    }
}

/// In-memory stand-in for the portal's notification state.
#[derive(Default)]
struct Server {
    deliveries: Mutex<Vec<NotificationDelivery>>,
    list_calls: AtomicUsize,
    rest_calls: AtomicUsize,
    failing_lists: AtomicUsize,
    rest_down: AtomicBool,
}

impl Server {
    fn with(deliveries: Vec<NotificationDelivery>) -> Arc<Self> {
        Arc::new(Self {
            deliveries: Mutex::new(deliveries),
            ..Default::default()
        })
    }

    fn mark(&self, id: &str) {
        let mut deliveries = self.deliveries.lock().unwrap();
        if let Some(d) = deliveries.iter_mut().find(|d| d.notification.id == id) {
            d.mark_read_at(Utc::now());
        }
    }

    fn set_unread(&self, id: &str) {
        let mut deliveries = self.deliveries.lock().unwrap();
        if let Some(d) = deliveries.iter_mut().find(|d| d.notification.id == id) {
            d.is_read = false;
            d.read_at = None;
        }
    }

    fn fail_next_lists(&self, n: usize) {
        self.failing_lists.store(n, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl NotificationApi for Server {
    async fn list_notifications(&self) -> Result<Vec<NotificationDelivery>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_lists.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_lists.store(failing - 1, Ordering::SeqCst);
            return Err(anyhow!("list unavailable"));
        }
        Ok(self.deliveries.lock().unwrap().clone())
    }

    async fn mark_read(&self, notification_id: &str) -> Result<()> {
        self.rest_calls.fetch_add(1, Ordering::SeqCst);
        if self.rest_down.load(Ordering::SeqCst) {
            return Err(anyhow!("rest endpoint down"));
        }
        self.mark(notification_id);
        Ok(())
    }
}

/// Push channel double with scripted failures and an optional hold point.
struct ScriptedPush {
    server: Arc<Server>,
    connected: AtomicBool,
    failures: Mutex<VecDeque<ChannelError>>,
    calls: AtomicUsize,
    hold: Option<(Arc<Notify>, Arc<Notify>)>,
    hang_next: AtomicBool,
}

impl ScriptedPush {
    fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            connected: AtomicBool::new(true),
            failures: Mutex::default(),
            calls: AtomicUsize::new(0),
            hold: None,
            hang_next: AtomicBool::new(false),
        }
    }

    fn disconnected(self) -> Self {
        self.connected.store(false, Ordering::SeqCst);
        self
    }

    fn failing_with(self, err: ChannelError) -> Self {
        self.failures.lock().unwrap().push_back(err);
        self
    }

    /// The next call never completes.
    fn hanging_once(self) -> Self {
        self.hang_next.store(true, Ordering::SeqCst);
        self
    }

    fn held(mut self, started: Arc<Notify>, release: Arc<Notify>) -> Self {
        self.hold = Some((started, release));
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DeliveryChannel for ScriptedPush {
    fn name(&self) -> &'static str {
        "push"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn mark_read(&self, notification_id: &str) -> Result<(), ChannelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_next.swap(false, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some((started, release)) = &self.hold {
            started.notify_one();
            release.notified().await;
        }
        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        self.server.mark(notification_id);
        Ok(())
    }
}

fn reconciler(push: Arc<ScriptedPush>, server: Arc<Server>) -> Arc<Reconciler> {
    Arc::new(Reconciler::with_rest_fallback(push, server))
}

fn free_viewer() -> ViewerContext {
    ViewerContext::viewer("u1", Tier::Free)
}

/// Link endpoints plus the socket-side halves a fake socket task drives.
fn push_link(capacity: usize) -> (PushLink, mpsc::Receiver<PushCommand>, watch::Sender<bool>) {
    let (commands, commands_rx) = mpsc::channel(capacity);
    let (events, _) = broadcast::channel(capacity);
    let (connected, connected_rx) = watch::channel(true);
    let link = PushLink {
        commands,
        events,
        connected: connected_rx,
    };
    (link, commands_rx, connected)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn concurrent_mark_read_submits_once() {
    let server = Server::with(vec![delivery("n1", Audience::All)]);
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let push = Arc::new(
        ScriptedPush::new(Arc::clone(&server)).held(Arc::clone(&started), Arc::clone(&release)),
    );
    let rec = reconciler(Arc::clone(&push), Arc::clone(&server));
    rec.refresh().await.unwrap();

    let first = {
        let rec = Arc::clone(&rec);
        tokio::spawn(async move { rec.mark_read("n1").await })
    };
    started.notified().await;
    assert_eq!(rec.pending("n1"), Some(PendingState::InFlight));

    let second = rec.mark_read("n1").await.unwrap();
    assert_eq!(second, MarkReadOutcome::Pending);

    release.notify_one();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first, MarkReadOutcome::Marked { via: "push" });

    assert_eq!(push.calls(), 1);
    assert_eq!(server.rest_calls.load(Ordering::SeqCst), 0);
    assert_eq!(rec.pending("n1"), None);
    assert_eq!(rec.unread_count(&free_viewer(), Utc::now()), 0);

    // Later calls see the confirmed state and send nothing.
    assert_eq!(
        rec.mark_read("n1").await.unwrap(),
        MarkReadOutcome::AlreadyRead
    );
    assert_eq!(push.calls(), 1);
}

#[tokio::test]
async fn disconnected_push_falls_back_to_rest() {
    let server = Server::with(vec![delivery("n1", Audience::All)]);
    let push = Arc::new(ScriptedPush::new(Arc::clone(&server)).disconnected());
    let rec = reconciler(Arc::clone(&push), Arc::clone(&server));

    let outcome = rec.mark_read("n1").await.unwrap();
    assert_eq!(outcome, MarkReadOutcome::Marked { via: "rest" });
    assert_eq!(push.calls(), 0);
    assert_eq!(server.rest_calls.load(Ordering::SeqCst), 1);
    assert!(rec.snapshot()[0].is_read);
}

#[tokio::test]
async fn push_failure_retries_over_rest() {
    let server = Server::with(vec![delivery("n1", Audience::All)]);
    let push = Arc::new(
        ScriptedPush::new(Arc::clone(&server)).failing_with(ChannelError::Timeout("push")),
    );
    let rec = reconciler(Arc::clone(&push), Arc::clone(&server));

    let outcome = rec.mark_read("n1").await.unwrap();
    assert_eq!(outcome, MarkReadOutcome::Marked { via: "rest" });
    assert_eq!(push.calls(), 1);
    assert_eq!(server.rest_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn both_channels_failing_surfaces_once_without_retry() {
    let server = Server::with(vec![delivery("n1", Audience::All)]);
    server.rest_down.store(true, Ordering::SeqCst);
    let push = Arc::new(ScriptedPush::new(Arc::clone(&server)).failing_with(
        ChannelError::Rejected {
            channel: "push",
            reason: "socket closed".into(),
        },
    ));
    let rec = reconciler(Arc::clone(&push), Arc::clone(&server));
    rec.refresh().await.unwrap();

    let err = rec.mark_read("n1").await.unwrap_err();
    match &err {
        EngineError::MarkReadFailed { id, push, .. } => {
            assert_eq!(id, "n1");
            assert!(push.is_some());
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.to_string().contains("try again"));
    assert_eq!(push.calls(), 1);
    assert_eq!(server.rest_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rec.pending("n1"), None);
    assert_eq!(rec.unread_count(&free_viewer(), Utc::now()), 1);
}

#[tokio::test]
async fn failed_refresh_keeps_id_pending_until_confirmed() {
    let server = Server::with(vec![delivery("n1", Audience::All)]);
    let push = Arc::new(ScriptedPush::new(Arc::clone(&server)));
    let rec = reconciler(Arc::clone(&push), Arc::clone(&server));
    rec.refresh().await.unwrap();

    server.fail_next_lists(1);
    let outcome = rec.mark_read("n1").await.unwrap();
    assert_eq!(outcome, MarkReadOutcome::Marked { via: "push" });
    assert_eq!(rec.pending("n1"), Some(PendingState::AwaitingConfirmation));
    // Still unread locally: nothing is fabricated.
    assert_eq!(rec.unread_count(&free_viewer(), Utc::now()), 1);
    assert_eq!(
        rec.mark_read("n1").await.unwrap(),
        MarkReadOutcome::Pending
    );

    rec.refresh().await.unwrap();
    assert_eq!(rec.pending("n1"), None);
    assert_eq!(rec.unread_count(&free_viewer(), Utc::now()), 0);
}

#[tokio::test]
async fn push_confirmation_from_another_device() {
    let server = Server::with(vec![delivery("n1", Audience::All), delivery("n2", Audience::All)]);
    let push = Arc::new(ScriptedPush::new(Arc::clone(&server)));
    let rec = reconciler(push, Arc::clone(&server));
    rec.refresh().await.unwrap();

    let read_at = Utc::now();
    rec.apply_push_event(&PushEvent::Read {
        id: "n2".into(),
        read_at,
    });
    let unread: Vec<_> = rec
        .unread(&free_viewer(), Utc::now())
        .into_iter()
        .map(|d| d.notification.id)
        .collect();
    assert_eq!(unread, vec!["n1"]);
    assert_eq!(rec.snapshot()[1].read_at, Some(read_at));
}

#[tokio::test]
async fn read_state_is_monotonic_across_refreshes() {
    let server = Server::with(vec![delivery("n1", Audience::All)]);
    let push = Arc::new(ScriptedPush::new(Arc::clone(&server)));
    let rec = reconciler(push, Arc::clone(&server));
    rec.mark_read("n1").await.unwrap();
    let read_at = rec.snapshot()[0].read_at;
    assert!(read_at.is_some());

    // A lagging replica reports it unread again.
    server.set_unread("n1");
    rec.refresh().await.unwrap();
    assert!(rec.snapshot()[0].is_read);
    assert_eq!(rec.snapshot()[0].read_at, read_at);
}

#[tokio::test]
async fn unread_view_applies_window_and_audience() {
    let mut expired = delivery("old", Audience::All);
    expired.notification.end_date_time =
        Some((Utc::now() - ChronoDuration::days(1)).to_rfc3339());
    let server = Server::with(vec![
        delivery("everyone", Audience::All),
        delivery("upsell", Audience::Free),
        delivery("members", Audience::Premium),
        expired,
    ]);
    let rec = reconciler(Arc::new(ScriptedPush::new(Arc::clone(&server))), Arc::clone(&server));
    rec.refresh().await.unwrap();

    let ids = |viewer: &ViewerContext| -> Vec<String> {
        rec.unread(viewer, Utc::now())
            .into_iter()
            .map(|d| d.notification.id)
            .collect()
    };
    assert_eq!(ids(&free_viewer()), vec!["everyone", "upsell"]);
    assert_eq!(
        ids(&ViewerContext::viewer("u2", Tier::Premium)),
        vec!["everyone", "members"]
    );
    let simulating = ViewerContext::admin("a1").with_simulation(Some(Tier::Free));
    assert_eq!(ids(&simulating), vec!["everyone", "upsell"]);
}

#[tokio::test]
async fn detached_consumer_discards_late_result() {
    let server = Server::with(vec![delivery("n1", Audience::All)]);
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let push = Arc::new(
        ScriptedPush::new(Arc::clone(&server)).held(Arc::clone(&started), Arc::clone(&release)),
    );
    let rec = reconciler(push, Arc::clone(&server));
    rec.refresh().await.unwrap();
    let lists_before = server.list_calls.load(Ordering::SeqCst);

    let in_flight = {
        let rec = Arc::clone(&rec);
        tokio::spawn(async move { rec.mark_read("n1").await })
    };
    started.notified().await;
    rec.detach();
    release.notify_one();

    assert_eq!(in_flight.await.unwrap().unwrap(), MarkReadOutcome::Discarded);
    // The server-side write still went through; the local view was left alone.
    assert!(server.deliveries.lock().unwrap()[0].is_read);
    assert!(!rec.snapshot()[0].is_read);
    assert!(server.list_calls.load(Ordering::SeqCst) > lists_before);
}

#[tokio::test(start_paused = true)]
async fn poller_refreshes_until_dropped() {
    let server = Server::with(vec![delivery("n1", Audience::All)]);
    let rec = reconciler(Arc::new(ScriptedPush::new(Arc::clone(&server))), Arc::clone(&server));

    let poller = rec.spawn_poller(Duration::from_secs(30));
    tokio::time::sleep(Duration::from_secs(61)).await;
    let calls = server.list_calls.load(Ordering::SeqCst);
    assert_eq!(calls, 3);
    assert_eq!(rec.snapshot().len(), 1);

    drop(poller);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(server.list_calls.load(Ordering::SeqCst), calls);
}

#[tokio::test(start_paused = true)]
async fn cancelled_mark_read_releases_the_id() {
    let server = Server::with(vec![delivery("n1", Audience::All)]);
    let push = Arc::new(ScriptedPush::new(Arc::clone(&server)).hanging_once());
    let rec = reconciler(Arc::clone(&push), Arc::clone(&server));
    rec.refresh().await.unwrap();

    let cancelled = tokio::time::timeout(Duration::from_millis(50), rec.mark_read("n1")).await;
    assert!(cancelled.is_err());
    assert_eq!(rec.pending("n1"), None);

    let outcome = rec.mark_read("n1").await.unwrap();
    assert_eq!(outcome, MarkReadOutcome::Marked { via: "push" });
    assert_eq!(push.calls(), 2);
}

#[tokio::test]
async fn refresh_showing_read_releases_in_flight_id() {
    let server = Server::with(vec![delivery("n1", Audience::All)]);
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let push = Arc::new(
        ScriptedPush::new(Arc::clone(&server)).held(Arc::clone(&started), Arc::clone(&release)),
    );
    let rec = reconciler(Arc::clone(&push), Arc::clone(&server));
    rec.refresh().await.unwrap();

    let in_flight = {
        let rec = Arc::clone(&rec);
        tokio::spawn(async move { rec.mark_read("n1").await })
    };
    started.notified().await;
    assert_eq!(rec.pending("n1"), Some(PendingState::InFlight));

    // Read on another device while this one's submission is still running.
    server.mark("n1");
    rec.refresh().await.unwrap();
    assert_eq!(rec.pending("n1"), None);
    assert_eq!(
        rec.mark_read("n1").await.unwrap(),
        MarkReadOutcome::AlreadyRead
    );

    release.notify_one();
    assert_eq!(
        in_flight.await.unwrap().unwrap(),
        MarkReadOutcome::Marked { via: "push" }
    );
    assert_eq!(rec.pending("n1"), None);
    assert_eq!(push.calls(), 1);
}

#[tokio::test]
async fn push_listener_applies_socket_confirmations() {
    let server = Server::with(vec![delivery("n1", Audience::All), delivery("n2", Audience::All)]);
    let (link, mut commands, _connected) = push_link(16);
    let events = link.events.clone();
    let push = Arc::new(PushChannel::new(link, Duration::from_secs(5)));
    let rec = Arc::new(Reconciler::with_rest_fallback(
        Arc::clone(&push) as Arc<dyn DeliveryChannel>,
        Arc::clone(&server) as Arc<dyn NotificationApi>,
    ));
    rec.refresh().await.unwrap();
    assert!(rec.refreshed_at().is_some());
    let _listener = rec.spawn_push_listener(push.subscribe());

    let socket = {
        let server = Arc::clone(&server);
        let events = events.clone();
        tokio::spawn(async move {
            while let Some(PushCommand::MarkRead { id }) = commands.recv().await {
                server.mark(&id);
                let read_at = Utc::now();
                if events.send(PushEvent::Read { id, read_at }).is_err() {
                    break;
                }
            }
        })
    };

    // The refresh after the write fails, so only the pushed confirmation can
    // settle the ledger entry and the local view.
    server.fail_next_lists(1);
    let outcome = rec.mark_read("n1").await.unwrap();
    assert_eq!(outcome, MarkReadOutcome::Marked { via: "push" });
    eventually(|| rec.pending("n1").is_none()).await;
    assert_eq!(server.rest_calls.load(Ordering::SeqCst), 0);

    // Another device reads n2; the socket forwards it.
    let read_at = Utc::now();
    events
        .send(PushEvent::Read {
            id: "n2".into(),
            read_at,
        })
        .unwrap();
    eventually(|| rec.unread_count(&free_viewer(), Utc::now()) == 0).await;
    assert_eq!(rec.snapshot()[1].read_at, Some(read_at));

    socket.abort();
}

#[tokio::test]
async fn lagged_push_listener_refreshes_then_stops_on_close() {
    let server = Server::with(vec![delivery("n1", Audience::All)]);
    let rec = reconciler(Arc::new(ScriptedPush::new(Arc::clone(&server))), Arc::clone(&server));
    let (events, rx) = broadcast::channel(2);
    let listener = rec.spawn_push_listener(rx);

    // The listener has not run yet, so these overflow its buffer.
    for i in 0..5 {
        events
            .send(PushEvent::Failed {
                id: format!("x{i}"),
                reason: "unrelated".into(),
            })
            .unwrap();
    }
    drop(events);

    eventually(|| listener.is_finished()).await;
    assert_eq!(server.list_calls.load(Ordering::SeqCst), 1);
    assert!(rec.refreshed_at().is_some());
    assert_eq!(rec.snapshot().len(), 1);
}
