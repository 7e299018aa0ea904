//! Per-connection state and the outbound message engine.
//!
//! Outbound traffic is tiered so one wedged client can never block service
//! to the others: producers try a bounded channel first; when it is full
//! they spill into an unbounded overflow backlog, and a client that is both
//! backed up and silent past the idle timeout is declared dead. A dedicated
//! writer task feeds the socket from the channel and refills from the
//! backlog whenever the channel runs dry, preserving strict FIFO order
//! within the session.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use dicecup::DieRoller;
use mapwire::event::Event;
use mapwire::list;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Seconds of silence after which a client with a full channel is dropped.
pub const IDLE_TIMEOUT_SECS: i64 = 180;

/// Messages buffered in the channel before we fall back to the more
/// expensive locked backlog.
pub const COMM_CHANNEL_BUFFER: usize = 256;

/// What travels down a session's outbound channel. `Bye` is the poison
/// pill: the writer closes the socket once it has drained everything ahead
/// of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Line(String),
    Bye,
}

pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub struct ClientSession {
    pub addr: SocketAddr,
    tx: mpsc::Sender<Outbound>,
    backlog: Mutex<VecDeque<String>>,
    // Last resort when even the poison pill cannot be queued.
    hard_close: Notify,
    // Wakes the reader task so it stops consuming input once we are done
    // with this client.
    closed: Notify,

    pub authenticated: AtomicBool,
    pub gm: AtomicBool,
    username: RwLock<Option<String>>,
    pub client_ident: RwLock<String>,
    pub write_only: AtomicBool,
    accepted: RwLock<Option<Vec<String>>>,
    pub last_heard: AtomicI64,
    pub unauthenticated_pings: AtomicU32,
    pub reached_eof: AtomicBool,
    pub dice: Mutex<DieRoller>,
}

impl ClientSession {
    pub fn new(addr: SocketAddr) -> (Arc<ClientSession>, mpsc::Receiver<Outbound>) {
        ClientSession::with_queue_depth(addr, COMM_CHANNEL_BUFFER)
    }

    pub fn with_queue_depth(
        addr: SocketAddr,
        depth: usize,
    ) -> (Arc<ClientSession>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(depth);
        let session = Arc::new(ClientSession {
            addr,
            tx,
            backlog: Mutex::new(VecDeque::new()),
            hard_close: Notify::new(),
            closed: Notify::new(),
            authenticated: AtomicBool::new(false),
            gm: AtomicBool::new(false),
            username: RwLock::new(None),
            client_ident: RwLock::new("unknown".into()),
            write_only: AtomicBool::new(false),
            accepted: RwLock::new(None),
            last_heard: AtomicI64::new(now_unix()),
            unauthenticated_pings: AtomicU32::new(0),
            reached_eof: AtomicBool::new(false),
            dice: Mutex::new(DieRoller::new()),
        });
        (session, rx)
    }

    pub fn username(&self) -> String {
        if !self.authenticated.load(Ordering::Relaxed) {
            return "unknown".into();
        }
        self.username
            .read()
            .clone()
            .unwrap_or_else(|| "unknown".into())
    }

    pub fn set_username(&self, name: &str) {
        *self.username.write() = Some(name.to_string());
    }

    pub fn is_gm(&self) -> bool {
        self.gm.load(Ordering::Relaxed)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    pub fn heard_from(&self) {
        self.last_heard.store(now_unix(), Ordering::Relaxed);
    }

    /// Restrict (or with `None`, stop restricting) the message types this
    /// client receives.
    pub fn set_accepted(&self, accepted: Option<Vec<String>>) {
        *self.accepted.write() = accepted;
    }

    fn accepts(&self, etype: &str) -> bool {
        match &*self.accepted.read() {
            None => true,
            Some(list) => list.iter().any(|t| t == etype),
        }
    }

    /// Send a discrete command and its parameters to this client.
    pub fn send<S: AsRef<str>>(&self, values: &[S]) {
        self.send_with_extra_data(values, &[]);
    }

    /// Same, plus the extra raw payload rows block-transfer events carry.
    pub fn send_event(&self, ev: &Event) {
        self.send_with_extra_data(&ev.fields, &ev.multi_raw_data);
    }

    fn send_with_extra_data<S: AsRef<str>>(&self, values: &[S], extra: &[String]) {
        let Some(first) = values.first() else {
            return;
        };
        if !self.accepts(first.as_ref()) {
            return;
        }
        let message = list::encode(values);
        if message.contains(['\n', '\r']) {
            warn!(client = %self.addr, "dropping message that would contain a newline");
            return;
        }
        self.queue_line(message);
        for row in extra {
            self.queue_line(row.clone());
        }
    }

    /// Pre-formed line, bypassing the accept filter.
    pub fn send_raw(&self, line: &str) {
        self.queue_line(line.to_string());
    }

    // The channel is the fast path. Once anything sits in the backlog, new
    // messages must follow it to keep FIFO order; the writer clears the
    // backlog only after draining the channel.
    fn queue_line(&self, line: String) {
        {
            let mut backlog = self.backlog.lock();
            if !backlog.is_empty() {
                backlog.push_back(line);
                return;
            }
        }

        match self.tx.try_send(Outbound::Line(line)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(Outbound::Line(line))) => {
                if now_unix() - self.last_heard.load(Ordering::Relaxed) > IDLE_TIMEOUT_SECS {
                    warn!(client = %self.addr, "terminating connection to dead or painfully slow client");
                    self.close();
                } else {
                    self.backlog.lock().push_back(line);
                }
            }
            Err(_) => {} // writer already gone
        }
    }

    /// Signal that we are done with this client. The socket stays open
    /// until the writer has drained everything queued ahead of the pill.
    pub fn close(&self) {
        self.reached_eof.store(true, Ordering::Relaxed);
        self.closed.notify_one();
        if self.tx.try_send(Outbound::Bye).is_err() {
            // No room even for the pill; shut the socket down directly.
            self.hard_close.notify_one();
        }
    }

    /// Close immediately, discarding anything still queued.
    pub fn close_now(&self) {
        self.reached_eof.store(true, Ordering::Relaxed);
        self.closed.notify_one();
        self.hard_close.notify_one();
    }

    /// Resolves once the session has been told to close; lets the reader
    /// task stop waiting for input from a client we are done with.
    pub async fn wait_closed(&self) {
        self.closed.notified().await;
    }

    pub fn is_closing(&self) -> bool {
        self.reached_eof.load(Ordering::Relaxed)
    }
}

/// Feed queued messages out to the client socket. Exits on the poison
/// pill, on a hard close, or on a write error; the socket is shut down on
/// the way out.
pub async fn writer_task<W: AsyncWrite + Unpin>(
    session: Arc<ClientSession>,
    mut rx: mpsc::Receiver<Outbound>,
    mut sock: W,
) {
    'feed: loop {
        let msg = tokio::select! {
            m = rx.recv() => m,
            _ = session.hard_close.notified() => None,
        };
        match msg {
            None | Some(Outbound::Bye) => break 'feed,
            Some(Outbound::Line(line)) => {
                if write_line(&mut sock, &line).await.is_err() {
                    break 'feed;
                }
            }
        }

        if rx.is_empty() {
            // Channel just ran dry: flush the overflow backlog straight to
            // the socket. Anything a producer slips into the channel while
            // we write is newer than the batch we took, and anything
            // appended to the backlog afterward is newer still, so drain
            // the channel again before touching the backlog a second time.
            loop {
                let batch: Vec<String> = {
                    let mut backlog = session.backlog.lock();
                    backlog.drain(..).collect()
                };
                if batch.is_empty() {
                    break;
                }
                for line in batch {
                    if write_line(&mut sock, &line).await.is_err() {
                        break 'feed;
                    }
                }
                if !rx.is_empty() {
                    break;
                }
            }
        }
    }
    info!(client = %session.addr, "disconnecting");
    session.reached_eof.store(true, Ordering::Relaxed);
    let _ = sock.shutdown().await;
}

async fn write_line<W: AsyncWrite + Unpin>(sock: &mut W, line: &str) -> std::io::Result<()> {
    sock.write_all(line.as_bytes()).await?;
    sock.write_all(b"\n").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lineio::LineReader;
    use std::sync::atomic::Ordering;

    fn addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    async fn read_all_lines<R: tokio::io::AsyncRead + Unpin>(r: R) -> Vec<String> {
        let mut lr = LineReader::new(r);
        let mut out = Vec::new();
        while let Ok(Some(line)) = lr.read_line().await {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn preserves_fifo_order_through_the_backlog() {
        let (session, rx) = ClientSession::with_queue_depth(addr(), 4);
        let (sock, peer) = tokio::io::duplex(64);
        let writer = tokio::spawn(writer_task(session.clone(), rx, sock));
        let reader = tokio::spawn(read_all_lines(peer));

        // the writer gets no chance to run while we enqueue, so most of
        // these spill through the channel into the backlog
        for i in 0..500 {
            let m = format!("m{i}");
            session.send(&["//", m.as_str()]);
        }
        assert!(!session.backlog.lock().is_empty());

        // let everything drain before asking for an orderly close
        while !session.backlog.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        session.close();

        let lines = reader.await.unwrap();
        writer.await.unwrap();
        assert_eq!(lines.len(), 500);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line, &format!("// m{i}"));
        }
    }

    #[tokio::test]
    async fn overflow_goes_to_backlog_while_client_is_live() {
        let (session, _rx) = ClientSession::with_queue_depth(addr(), 2);
        session.heard_from();
        for i in 0..10 {
            let m = format!("{i}");
            session.send(&["M", m.as_str()]);
        }
        // two fit in the channel, the rest queue up, nobody is evicted
        assert!(!session.is_closing());
        assert_eq!(session.backlog.lock().len(), 8);
    }

    #[tokio::test]
    async fn evicts_idle_client_with_full_queue() {
        let (session, _rx) = ClientSession::with_queue_depth(addr(), 1);
        session
            .last_heard
            .store(now_unix() - IDLE_TIMEOUT_SECS - 5, Ordering::Relaxed);
        session.send(&["M", "1"]); // fills the channel
        assert!(!session.is_closing());
        session.send(&["M", "2"]); // full + idle: eviction
        assert!(session.is_closing());
    }

    #[tokio::test]
    async fn poison_pill_drains_queue_before_close() {
        let (session, rx) = ClientSession::with_queue_depth(addr(), 8);
        let (sock, peer) = tokio::io::duplex(512);
        let writer = tokio::spawn(writer_task(session.clone(), rx, sock));

        session.send(&["//", "first"]);
        session.send(&["//", "second"]);
        session.close();
        session.send(&["//", "after close"]); // lost by design

        let lines = read_all_lines(peer).await;
        writer.await.unwrap();
        assert_eq!(lines, ["// first", "// second"]);
    }

    #[tokio::test]
    async fn subscription_filter_drops_unwanted_types() {
        let (session, mut rx) = ClientSession::with_queue_depth(addr(), 8);
        session.set_accepted(Some(vec!["TO".into(), "ROLL".into()]));
        session.send(&["AV", "1", "2"]);
        session.send(&["TO", "a", "b", "hello", "1"]);
        session.set_accepted(None);
        session.send(&["AV", "3", "4"]);

        let mut got = Vec::new();
        while let Ok(m) = rx.try_recv() {
            got.push(m);
        }
        assert_eq!(
            got,
            [
                Outbound::Line("TO a b hello 1".into()),
                Outbound::Line("AV 3 4".into()),
            ]
        );
    }

    #[tokio::test]
    async fn block_transfer_rows_follow_their_event() {
        let (session, mut rx) = ClientSession::with_queue_depth(addr(), 8);
        let mut ev = Event::parse("LS", "obj1", "E").unwrap();
        ev.multi_raw_data = vec!["LS: {data row}".into(), "LS. 1 cksum".into()];
        session.send_event(&ev);

        let mut got = Vec::new();
        while let Ok(Outbound::Line(l)) = rx.try_recv() {
            got.push(l);
        }
        assert_eq!(got, ["LS", "LS: {data row}", "LS. 1 cksum"]);
    }

    #[tokio::test]
    async fn rejects_messages_with_newlines() {
        let (session, mut rx) = ClientSession::with_queue_depth(addr(), 8);
        session.send(&["//", "bad\nline"]);
        assert!(rx.try_recv().is_err());
    }
}
