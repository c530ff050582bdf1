mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::SinkExt;
use hyper::{Body, Request, StatusCode};
use tokio::net::TcpListener;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use common::{event, eventually, fast_policy, json, sse, MockServer};
use pnl_dash::metrics::REJECTS;
use pnl_dash::{ChannelPolicy, ChannelState, InventorySnapshot, OrderBook, StateStore, StreamChannel, TickerSample, Topic};

const WAIT: Duration = Duration::from_secs(5);

fn publishing<T: pnl_dash::normalize::Normalize>(store: &StateStore) -> impl Fn(T) + Send + Sync + 'static {
    let store = store.clone();
    move |v: T| store.publish(v)
}

#[tokio::test]
async fn ticker_strings_end_to_end_and_bad_messages_leave_store_alone() {
    let server = MockServer::spawn(|_req: Request<Body>| async {
        sse(
            vec![
                event(r#"{"mid":"42000.125","bid":"42000.00","ask":"42000.25","ts":"1700000000"}"#, None),
                event(r#"{"mid":"NaN","bid":"42000.00","ask":"42000.25","ts":"1700000001"}"#, None),
                event("{not json", None),
                event(r#"{"mid":"abc","bid":"1","ask":"2","ts":"3"}"#, None),
                event(r#"{"mid":1,"bid":1,"ask":1}"#, None),
            ],
            Duration::from_millis(30),
            true,
        )
    })
    .await;

    let store = StateStore::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let _sub = store.subscribe(Topic::Ticker, move |snap| s.lock().unwrap().push(snap.clone()));

    let mut ch = StreamChannel::open::<TickerSample, _>(
        server.url("/stream/ticker"),
        publishing::<TickerSample>(&store),
        fast_policy(),
    )
    .unwrap();

    let expected = TickerSample { mid: 42000.125, bid: 42000.00, ask: 42000.25, ts: 1_700_000_000 };
    assert!(eventually(WAIT, || store.ticker().is_some()).await);
    assert_eq!(store.ticker(), Some(expected));

    // let the four bad frames arrive
    sleep(Duration::from_millis(300)).await;
    assert_eq!(store.ticker(), Some(expected));
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(ch.state(), ChannelState::Open);
    ch.close();
}

#[tokio::test]
async fn orders_are_replaced_not_merged() {
    let server = MockServer::spawn(|_req: Request<Body>| async {
        sse(
            vec![
                event(r#"[{"oid":"a","side":"buy","px":"100.5","qty":"0.01"}]"#, None),
                event(r#"[{"oid":"b","side":"sell","px":"101","qty":"0.02"}]"#, None),
            ],
            Duration::from_millis(30),
            true,
        )
    })
    .await;

    let store = StateStore::new();
    let mut ch = StreamChannel::open::<OrderBook, _>(
        server.url("/stream/orders"),
        publishing::<OrderBook>(&store),
        fast_policy(),
    )
    .unwrap();

    assert!(eventually(WAIT, || store.orders().map_or(false, |b| b.get("b").is_some())).await);
    let book = store.orders().unwrap();
    assert_eq!(book.len(), 1);
    assert!(book.get("a").is_none());
    ch.close();
}

#[tokio::test]
async fn reconnects_after_drop_and_resumes_with_last_event_id() {
    let conns = Arc::new(AtomicUsize::new(0));
    let last_ids: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let (c, ids) = (conns.clone(), last_ids.clone());
    let server = MockServer::spawn(move |req: Request<Body>| {
        let n = c.fetch_add(1, Ordering::SeqCst);
        let hdr = req.headers().get("last-event-id").and_then(|v| v.to_str().ok()).map(str::to_string);
        ids.lock().unwrap().push(hdr);
        async move {
            match n {
                // first connection: one message, then the server hangs up
                0 => sse(vec![event(r#"{"equity":"1","cash":"1","inventory":"0"}"#, Some("7"))], Duration::ZERO, false),
                // second: refused at the HTTP level
                1 => json(StatusCode::SERVICE_UNAVAILABLE, "{}"),
                _ => sse(vec![event(r#"{"equity":"2","cash":"1","inventory":"1"}"#, Some("8"))], Duration::ZERO, true),
            }
        }
    })
    .await;

    let store = StateStore::new();
    let mut ch = StreamChannel::open::<InventorySnapshot, _>(
        server.url("/stream/pnl"),
        publishing::<InventorySnapshot>(&store),
        fast_policy(),
    )
    .unwrap();

    assert!(eventually(WAIT, || store.inventory().map_or(false, |i| i.equity == 2.0)).await);
    assert!(conns.load(Ordering::SeqCst) >= 3);
    assert_eq!(ch.state(), ChannelState::Open);
    let ids = last_ids.lock().unwrap().clone();
    assert_eq!(ids[0], None);
    assert_eq!(ids[2].as_deref(), Some("7"));
    ch.close();
}

#[tokio::test]
async fn close_is_idempotent_and_stops_delivery() {
    let server = MockServer::spawn(|_req: Request<Body>| async {
        let frames = (0..200)
            .map(|i| event(&format!(r#"{{"mid":{i},"bid":{i},"ask":{i},"ts":{i}}}"#), None))
            .collect();
        sse(frames, Duration::from_millis(10), true)
    })
    .await;

    let store = StateStore::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let sink_store = store.clone();
    let mut ch = StreamChannel::open::<TickerSample, _>(
        server.url("/stream/ticker"),
        move |t: TickerSample| {
            h.fetch_add(1, Ordering::SeqCst);
            sink_store.publish(t);
        },
        fast_policy(),
    )
    .unwrap();

    assert!(eventually(WAIT, || hits.load(Ordering::SeqCst) >= 3).await);
    ch.close();
    let at_close = hits.load(Ordering::SeqCst);
    let value_at_close = store.ticker();
    ch.close();
    assert_eq!(ch.state(), ChannelState::Closed);

    sleep(Duration::from_millis(150)).await;
    assert_eq!(hits.load(Ordering::SeqCst), at_close);
    assert_eq!(store.ticker(), value_at_close);
    assert_eq!(ch.state(), ChannelState::Closed);
}

#[tokio::test]
async fn state_machine_reaches_open_then_closed() {
    let server = MockServer::spawn(|_req: Request<Body>| async { sse(vec![], Duration::ZERO, true) }).await;
    let store = StateStore::new();
    let mut ch = StreamChannel::open::<TickerSample, _>(
        server.url("/stream/ticker"),
        publishing::<TickerSample>(&store),
        fast_policy(),
    )
    .unwrap();
    let mut rx = ch.watch_state();
    assert!(tokio::time::timeout(WAIT, rx.wait_for(|s| *s == ChannelState::Open)).await.is_ok());
    ch.close();
    assert_eq!(*rx.borrow(), ChannelState::Closed);
}

#[tokio::test]
async fn websocket_transport_delivers_and_reconnects() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut n = 0u32;
        while let Ok((tcp, _)) = listener.accept().await {
            n += 1;
            let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else { continue };
            let body = format!(r#"{{"equity":"{n}","cash":"5","inventory":"0.5"}}"#);
            let _ = ws.send(Message::Text(body)).await;
            if n == 1 {
                let _ = ws.close(None).await;
            } else {
                tokio::spawn(async move {
                    sleep(Duration::from_secs(3600)).await;
                    drop(ws);
                });
            }
        }
    });

    let store = StateStore::new();
    let url = Url::parse(&format!("ws://{addr}/stream/pnl")).unwrap();
    let mut ch =
        StreamChannel::open::<InventorySnapshot, _>(url, publishing::<InventorySnapshot>(&store), fast_policy())
            .unwrap();

    assert!(eventually(WAIT, || store.inventory().map_or(false, |i| i.equity == 2.0)).await);
    assert_eq!(store.inventory().unwrap().cash, 5.0);
    ch.close();
}

#[tokio::test]
async fn idle_timeout_forces_reconnect() {
    let conns = Arc::new(AtomicUsize::new(0));
    let c = conns.clone();
    let server = MockServer::spawn(move |_req: Request<Body>| {
        c.fetch_add(1, Ordering::SeqCst);
        async { sse(vec![], Duration::ZERO, true) }
    })
    .await;

    let store = StateStore::new();
    let mut policy = fast_policy();
    policy.idle_timeout = Some(Duration::from_millis(50));
    let mut ch =
        StreamChannel::open::<TickerSample, _>(server.url("/stream/ticker"), publishing::<TickerSample>(&store), policy)
            .unwrap();

    assert!(eventually(WAIT, || conns.load(Ordering::SeqCst) >= 2).await);
    ch.close();
}

#[tokio::test]
async fn stalled_connect_times_out_and_retries() {
    let conns = Arc::new(AtomicUsize::new(0));
    let c = conns.clone();
    let server = MockServer::spawn(move |_req: Request<Body>| {
        let n = c.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                // accept the request, never send headers
                sleep(Duration::from_secs(3600)).await;
            }
            sse(
                vec![event(r#"{"mid":"10","bid":"9","ask":"11","ts":"5"}"#, None)],
                Duration::ZERO,
                true,
            )
        }
    })
    .await;

    let store = StateStore::new();
    let mut policy = fast_policy();
    policy.connect_timeout = Duration::from_millis(200);
    let mut ch =
        StreamChannel::open::<TickerSample, _>(server.url("/stream/ticker"), publishing::<TickerSample>(&store), policy)
            .unwrap();

    assert!(eventually(WAIT, || store.ticker().is_some()).await);
    assert!(conns.load(Ordering::SeqCst) >= 2);
    assert_eq!(store.ticker().unwrap().ts, 5);
    assert_eq!(ch.state(), ChannelState::Open);
    ch.close();
}

#[tokio::test]
async fn backoff_grows_on_failures_and_resets_after_delivery() {
    let arrivals: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let a = arrivals.clone();
    let server = MockServer::spawn(move |_req: Request<Body>| {
        let n = {
            let mut seen = a.lock().unwrap();
            seen.push(Instant::now());
            seen.len() - 1
        };
        async move {
            match n {
                // one good message, then the stream ends
                4 => sse(vec![event(r#"{"equity":"1","cash":"1","inventory":"0"}"#, None)], Duration::ZERO, false),
                _ => json(StatusCode::SERVICE_UNAVAILABLE, "{}"),
            }
        }
    })
    .await;

    let store = StateStore::new();
    let policy = ChannelPolicy {
        backoff_base: Duration::from_millis(40),
        backoff_max: Duration::from_secs(2),
        ..fast_policy()
    };
    let mut ch = StreamChannel::open::<InventorySnapshot, _>(
        server.url("/stream/pnl"),
        publishing::<InventorySnapshot>(&store),
        policy,
    )
    .unwrap();

    assert!(eventually(WAIT, || arrivals.lock().unwrap().len() >= 6).await);
    ch.close();
    assert!(store.inventory().is_some());

    let t = arrivals.lock().unwrap().clone();
    let gap: Vec<Duration> = t.windows(2).map(|w| w[1] - w[0]).collect();
    // 40, 80, 160, 320ms before the delivering connection
    assert!(gap[0] >= Duration::from_millis(40), "{gap:?}");
    assert!(gap[2] >= Duration::from_millis(160), "{gap:?}");
    assert!(gap[3] >= Duration::from_millis(320), "{gap:?}");
    // back to the base delay once a message got through
    assert!(gap[4] < Duration::from_millis(200), "{gap:?}");
    assert!(gap[4] * 2 < gap[3], "{gap:?}");
}

#[tokio::test]
async fn websocket_undecodable_binary_frame_is_counted_and_skipped() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let conns = Arc::new(AtomicUsize::new(0));
    let c = conns.clone();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            c.fetch_add(1, Ordering::SeqCst);
            let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else { continue };
            let _ = ws.send(Message::Binary(vec![0xff, 0xfe, 0xfd])).await;
            let body = r#"[{"oid":"w1","side":"sell","px":"101.5","qty":"0.3"}]"#;
            let _ = ws.send(Message::Text(body.to_string())).await;
            tokio::spawn(async move {
                sleep(Duration::from_secs(3600)).await;
                drop(ws);
            });
        }
    });

    let rejects = REJECTS.with_label_values(&["orders", "decode"]);
    let before = rejects.get();
    let store = StateStore::new();
    let url = Url::parse(&format!("ws://{addr}/stream/orders")).unwrap();
    let mut ch = StreamChannel::open::<OrderBook, _>(url, publishing::<OrderBook>(&store), fast_policy()).unwrap();

    assert!(eventually(WAIT, || store.orders().is_some()).await);
    assert_eq!(store.orders().unwrap().get("w1").unwrap().qty, 0.3);
    assert!(rejects.get() >= before + 1);
    assert_eq!(conns.load(Ordering::SeqCst), 1);
    ch.close();
}
