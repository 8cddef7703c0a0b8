//! NAL fan-out to an RTSP server.
//!
//! The stage owns a pool of reusable NAL buffers and a work queue. Incoming
//! payloads are copied into pooled buffers under a timed lock; when the pool
//! runs dry the oldest queued payload is dropped and its buffer reused, so a
//! slow session sheds load instead of backing the encoder up. A helper
//! thread runs the server library's event loop and pulls queued payloads
//! through [`NalQueue::deliver`], which respects the library's per-delivery
//! size limit by splitting oversized NALs into an overflow carried into the
//! next delivery.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common_io::{SendError, SEND_TIMEOUT};
use config::RtspCfg;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, info};

/// Buffers pre-allocated for queued NALs.
pub const NAL_POOL_NUM: usize = 20;
/// Initial size of each pooled buffer; buffers grow to fit larger NALs.
pub const NAL_BUF_LEN: usize = 20 * 1024;

pub const RTSP_PORT: u16 = 8554;
pub const RTP_PORT: u16 = 18888;
pub const RTCP_PORT: u16 = 18889;
pub const TTL: u8 = 255;
pub const STREAM_PATH: &str = "/camera";
pub const SESSION_NAME: &str = "tracker";

/// Lock budget inside the server's get-next-frame callback. The event loop
/// must never be held up by the pipeline side.
const DELIVER_TIMEOUT: Duration = Duration::from_micros(20);

struct QueuedNal {
    buf: Vec<u8>,
    len: usize,
}

struct Queues {
    pool: Vec<Vec<u8>>,
    work: std::collections::VecDeque<QueuedNal>,
    overflow: Vec<u8>,
}

/// One delivered payload, at most the destination's length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    pub len: usize,
    pub pts: SystemTime,
    pub duration_us: u32,
}

pub struct NalQueue {
    queues: Mutex<Queues>,
}

impl NalQueue {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Queues {
                pool: (0..NAL_POOL_NUM).map(|_| vec![0u8; NAL_BUF_LEN]).collect(),
                work: std::collections::VecDeque::with_capacity(NAL_POOL_NUM),
                overflow: Vec::new(),
            }),
        }
    }

    /// Copies one NAL into a pooled buffer and queues it. When the pool is
    /// empty the oldest queued NAL is dropped and its buffer reused.
    pub fn try_send(&self, nal: &[u8]) -> Result<(), SendError> {
        let mut q = self
            .queues
            .try_lock_for(SEND_TIMEOUT)
            .ok_or(SendError::Busy)?;

        let mut buf = match q.pool.pop() {
            Some(buf) => buf,
            None => match q.work.pop_front() {
                Some(dropped) => {
                    debug!("nal pool empty, dropping back (queued: {})", q.work.len());
                    dropped.buf
                }
                None => vec![0u8; NAL_BUF_LEN.max(nal.len())],
            },
        };
        if buf.len() < nal.len() {
            buf.resize(nal.len(), 0);
        }
        buf[..nal.len()].copy_from_slice(nal);
        q.work.push_back(QueuedNal {
            buf,
            len: nal.len(),
        });
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.queues.lock().work.len()
    }

    /// The server's get-next-frame pull. `dest.len()` is the library's
    /// maximum payload; a longer NAL is delivered in prefix-sized pieces,
    /// with pending overflow always prepended so the byte stream stays in
    /// order.
    pub fn deliver(&self, dest: &mut [u8]) -> Option<Delivered> {
        let mut q = self.queues.try_lock_for(DELIVER_TIMEOUT)?;
        if q.work.is_empty() && q.overflow.is_empty() {
            return None;
        }

        let mut payload = std::mem::take(&mut q.overflow);
        if let Some(nal) = q.work.pop_front() {
            payload.extend_from_slice(&nal.buf[..nal.len]);
            q.pool.push(nal.buf);
        }

        let len = payload.len().min(dest.len());
        dest[..len].copy_from_slice(&payload[..len]);
        if len < payload.len() {
            q.overflow = payload.split_off(len);
        }

        Some(Delivered {
            len,
            pts: SystemTime::now(),
            duration_us: 0,
        })
    }
}

impl Default for NalQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer handle held by the encoder.
#[derive(Clone)]
pub struct NalSender {
    queue: Arc<NalQueue>,
}

impl NalSender {
    pub fn from_queue(queue: Arc<NalQueue>) -> Self {
        Self { queue }
    }

    pub fn try_send(&self, nal: &[u8]) -> Result<(), SendError> {
        self.queue.try_send(nal)
    }
}

/// Wakes the session thread when new NALs are queued.
#[derive(Clone)]
pub struct Wakeup {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Wakeup {
    fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn notify(&self) {
        let (flag, cv) = &*self.inner;
        *flag.lock() = true;
        cv.notify_one();
    }

    /// Returns true when woken by a notify, false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cv) = &*self.inner;
        let mut pending = flag.lock();
        if !*pending {
            cv.wait_for(&mut pending, timeout);
        }
        std::mem::take(&mut *pending)
    }
}

/// Where the RTP/RTCP packets go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast(Ipv4Addr),
    /// Source-specific multicast, chosen at random when no unicast address
    /// is supplied.
    Multicast(Ipv4Addr),
}

impl Destination {
    pub fn from_unicast(addr: &str) -> Self {
        match addr.parse::<Ipv4Addr>() {
            Ok(ip) if !addr.is_empty() => Destination::Unicast(ip),
            _ => {
                let mut rng = rand::thread_rng();
                Destination::Multicast(Ipv4Addr::new(
                    232,
                    rng.gen_range(1..=255),
                    rng.gen_range(0..=255),
                    rng.gen_range(1..=254),
                ))
            }
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        match self {
            Destination::Unicast(ip) | Destination::Multicast(ip) => *ip,
        }
    }
}

/// Session parameters handed to the streaming backend.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub destination: Destination,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    pub ttl: u8,
    pub path: String,
    pub session_name: String,
}

/// Everything the backend's event loop needs: the session parameters, the
/// queue to pull payloads from, the wakeup it should block on, and the
/// shutdown watch it must honor.
pub struct SessionContext {
    pub config: SessionConfig,
    pub queue: Arc<NalQueue>,
    pub wakeup: Wakeup,
    pub shutdown: Arc<AtomicBool>,
}

/// Contract with the external RTSP server library. `serve` owns the calling
/// thread as the library's event loop until the shutdown watch goes true.
pub trait StreamHost: Send + 'static {
    fn serve(&mut self, ctx: SessionContext) -> anyhow::Result<()>;
}

/// Stand-in host used when no server library adapter is linked: it keeps
/// the delivery side of the queue moving and discards the payloads, so the
/// rest of the pipeline behaves exactly as with a live session.
#[derive(Default)]
pub struct DrainHost {
    delivered: u64,
}

impl DrainHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamHost for DrainHost {
    fn serve(&mut self, ctx: SessionContext) -> anyhow::Result<()> {
        let mut buf = vec![0u8; NAL_BUF_LEN];
        while !ctx.shutdown.load(Ordering::SeqCst) {
            ctx.wakeup.wait_timeout(Duration::from_millis(20));
            while ctx.queue.deliver(&mut buf).is_some() {
                self.delivered += 1;
            }
        }
        debug!("drain host delivered {} payloads", self.delivered);
        Ok(())
    }
}

/// The RTSP pipeline stage: owns the queue and the session thread, and
/// nudges the event loop whenever work is pending.
pub struct RtspStage<H: StreamHost> {
    queue: Arc<NalQueue>,
    wakeup: Wakeup,
    shutdown: Arc<AtomicBool>,
    destination: Destination,
    host: Option<H>,
    session: Option<std::thread::JoinHandle<(H, anyhow::Result<()>)>>,
    on: bool,
}

impl<H: StreamHost> RtspStage<H> {
    pub fn new(cfg: &RtspCfg, host: H) -> (Self, NalSender) {
        let queue = Arc::new(NalQueue::new());
        let sender = NalSender {
            queue: Arc::clone(&queue),
        };
        (
            Self {
                queue,
                wakeup: Wakeup::new(),
                shutdown: Arc::new(AtomicBool::new(false)),
                destination: Destination::from_unicast(&cfg.unicast),
                host: Some(host),
                session: None,
                on: false,
            },
            sender,
        )
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }
}

impl<H: StreamHost> worker::Stage for RtspStage<H> {
    fn waiting_to_run(&mut self) -> anyhow::Result<()> {
        if !self.on {
            let mut host = self
                .host
                .take()
                .ok_or_else(|| anyhow::anyhow!("stream host already consumed"))?;
            let ctx = SessionContext {
                config: SessionConfig {
                    destination: self.destination,
                    rtp_port: RTP_PORT,
                    rtcp_port: RTCP_PORT,
                    ttl: TTL,
                    path: STREAM_PATH.to_string(),
                    session_name: SESSION_NAME.to_string(),
                },
                queue: Arc::clone(&self.queue),
                wakeup: self.wakeup.clone(),
                shutdown: Arc::clone(&self.shutdown),
            };
            self.shutdown.store(false, Ordering::SeqCst);
            info!(
                "Play this stream using: rtsp://<host>:{}{}",
                RTSP_PORT, STREAM_PATH
            );
            self.session = Some(
                std::thread::Builder::new()
                    .name("rtsp-session".into())
                    .spawn(move || {
                        let result = host.serve(ctx);
                        (host, result)
                    })
                    .map_err(|e| anyhow::anyhow!("spawn rtsp session thread: {e}"))?,
            );
            self.on = true;
        }
        Ok(())
    }

    fn running(&mut self) -> anyhow::Result<()> {
        if self.on && self.queue.pending() != 0 {
            self.wakeup.notify();
        }
        Ok(())
    }

    fn waiting_to_halt(&mut self) -> anyhow::Result<()> {
        if self.on {
            self.shutdown.store(true, Ordering::SeqCst);
            self.wakeup.notify();
            if let Some(session) = self.session.take() {
                match session.join() {
                    Ok((host, result)) => {
                        // The host comes back so a later run() can restart
                        // the session.
                        self.host = Some(host);
                        if let Err(err) = result {
                            debug!("rtsp session ended with error: {err:#}");
                        }
                    }
                    Err(_) => debug!("rtsp session thread panicked"),
                }
            }
            self.on = false;
        }
        Ok(())
    }
}
