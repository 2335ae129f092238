// End-to-end scenarios across the environment, transport, panels and
// overlays, using channel-backed frames and a scripted HTTP backend.

use async_trait::async_trait;
use common::{names, BridgeError, RuntimeConfig, User, WireMessage};
use futures::FutureExt;
use panel_runtime::{
    ChannelFrameFactory, Environment, EnvironmentOptions, FrameCommand, HttpBackend, HttpCall,
    HttpReply, MemoryHistoryBackend, OverlayManager, OverlayRequest, Panel, PanelOptions,
    SsoEndpoint,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const ORIGIN: &str = "https://cdn.example";

struct StubSso;

#[async_trait]
impl SsoEndpoint for StubSso {
    async fn resolve_user(&self, _bearer: Option<&str>) -> Result<User, BridgeError> {
        Ok(User::new(7))
    }
}

struct StubHttp {
    replies: Mutex<VecDeque<HttpReply>>,
    calls: Mutex<Vec<HttpCall>>,
}

impl StubHttp {
    fn new(replies: Vec<(u16, Value)>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|(status, body)| HttpReply { status, body })
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpBackend for StubHttp {
    async fn execute(&self, call: HttpCall) -> Result<HttpReply, BridgeError> {
        self.calls.lock().unwrap().push(call);
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(HttpReply {
                status: 200,
                body: Value::Null,
            }))
    }
}

struct Rig {
    env: Arc<Environment>,
    factory: Arc<ChannelFrameFactory>,
    http: Arc<StubHttp>,
}

fn rig(replies: Vec<(u16, Value)>) -> Rig {
    let mut config = RuntimeConfig::default();
    config.environment_url = ORIGIN.to_string();
    let factory = ChannelFrameFactory::new();
    let http = StubHttp::new(replies);
    let env = Environment::new(
        Arc::new(config),
        Arc::new(StubSso),
        factory.clone(),
        MemoryHistoryBackend::new(),
        http.clone(),
    );
    Rig { env, factory, http }
}

async fn sign_in(env: &Arc<Environment>) {
    let minted = Arc::new(AtomicUsize::new(0));
    env.auth().set_token_factory(Arc::new(move |_refresh| {
        let minted = minted.clone();
        async move {
            let n = minted.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("token-{}", n))
        }
        .boxed()
    }));
    env.auth().check_user_state().await.expect("sign in");
    assert!(env.auth().is_authorized());
}

fn ready(env: &Arc<Environment>, location: &str) -> WireMessage {
    WireMessage::new(names::READY, &env.context().group_id)
        .with_field("location", Value::String(location.to_string()))
        .with_field("status_code", Value::from(200))
}

#[tokio::test]
async fn ready_from_the_registered_origin_transitions_the_panel() {
    let rig = rig(vec![]);
    let panel = Panel::new(
        rig.env.context().clone(),
        "panel-1",
        PanelOptions::default(),
    );

    let channel = panel.window_channel().expect("registered");
    channel.deliver(ORIGIN, ready(&rig.env, "https://cdn.example/app"));

    assert!(panel.is_ready());
    assert_eq!(panel.location().as_deref(), Some("https://cdn.example/app"));
}

#[tokio::test]
async fn opening_before_authorization_never_opens_the_frame() {
    let rig = rig(vec![]);
    let panel = Panel::new(
        rig.env.context().clone(),
        "panel-1",
        PanelOptions::default(),
    );

    let result = panel.open(Some("/messenger"), false).await;
    assert!(matches!(result, Err(BridgeError::Unauthorized(_))));
    assert!(!panel.is_open());

    // and the frame was never navigated
    let mut frame_rx = rig.factory.take_receiver("panel-1").expect("frame");
    assert!(frame_rx.try_recv().is_err());
}

#[tokio::test]
async fn overlays_with_the_same_id_share_one_panel() {
    let rig = rig(vec![]);
    sign_in(&rig.env).await;
    let overlays = OverlayManager::new(rig.env.context().clone());

    let first = overlays
        .open(OverlayRequest {
            overlay_id: Some("filebrowser".into()),
            title: Some("Files".into()),
            url: Some("/files/a".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(rig.factory.take_receiver("filebrowser").is_some());

    let second = overlays
        .open(OverlayRequest {
            overlay_id: Some("filebrowser".into()),
            title: Some("Shared files".into()),
            url: Some("/files/b".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.title().as_deref(), Some("Shared files"));
    assert!(rig.factory.take_receiver("filebrowser").is_none());
}

#[tokio::test]
async fn attachment_urls_get_the_preview_overlay_class() {
    let rig = rig(vec![]);
    let overlays = OverlayManager::new(rig.env.context().clone());

    let panel = overlays.get_overlay(&OverlayRequest {
        overlay_type: Some("overlay".into()),
        url: Some("https://cdn.example/content/attachments/42".into()),
        ..Default::default()
    });

    assert_eq!(panel.options().css_class.as_deref(), Some("preview"));
    assert_eq!(panel.options().panel_type.as_deref(), Some("preview"));
}

#[tokio::test]
async fn rejected_fetch_retries_once_with_a_fresh_token() {
    let rig = rig(vec![
        (401, Value::Null),
        (401, json!({"detail": "expired session"})),
    ]);
    sign_in(&rig.env).await;

    let result = rig.env.fetch("/api/apps", None, None).await;
    match result {
        Err(BridgeError::Http { status: 401, message }) => {
            assert_eq!(message, "expired session");
        }
        other => panic!("expected Http 401, got {:?}", other),
    }

    assert_eq!(rig.http.call_count(), 2);
    let calls = rig.http.calls.lock().unwrap();
    assert_ne!(calls[0].bearer, calls[1].bearer);
}

#[tokio::test]
async fn configure_sign_in_open_and_restore() {
    let rig = rig(vec![(200, json!({"status": "ok", "version": "1.0"}))]);

    let bootstrap = rig
        .env
        .configure(EnvironmentOptions::default())
        .await
        .unwrap();
    assert_eq!(bootstrap["version"], json!("1.0"));

    sign_in(&rig.env).await;

    let panel = Panel::new(
        rig.env.context().clone(),
        "messenger",
        PanelOptions {
            title: Some("Messenger".into()),
            ..Default::default()
        },
    );
    let mut frame_rx = rig.factory.take_receiver("messenger").expect("frame");

    panel.open(Some("/messenger"), false).await.unwrap();
    match frame_rx.try_recv() {
        Ok(FrameCommand::Navigate(url)) => assert_eq!(url, "https://cdn.example/messenger"),
        other => panic!("expected navigation, got {:?}", other),
    }

    panel
        .window_channel()
        .unwrap()
        .deliver(ORIGIN, ready(&rig.env, "https://cdn.example/messenger"));
    assert!(panel.is_ready());
    assert!(panel.is_open());

    let restored = rig.env.restore_history();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].panel_id, "messenger");
    assert!(restored[0].is_open);
    assert_eq!(restored[0].title.as_deref(), Some("Messenger"));
}

#[tokio::test]
async fn frame_requested_close_closes_the_panel() {
    let rig = rig(vec![]);
    sign_in(&rig.env).await;
    let panel = Panel::new(
        rig.env.context().clone(),
        "panel-1",
        PanelOptions::default(),
    );
    panel.open(Some("/app"), false).await.unwrap();
    assert!(panel.is_open());

    let channel = panel.window_channel().unwrap();
    channel.deliver(
        ORIGIN,
        WireMessage::new(names::REQUEST_CLOSE, &rig.env.context().group_id),
    );

    // the close runs on a spawned task
    for _ in 0..10 {
        if !panel.is_open() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!panel.is_open());
}
