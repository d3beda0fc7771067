
//! Mount records and request bookkeeping
//!
//! References are managed as follows: the transport to the server - a
//! network connection or pipe - is held alive by the mount, and the mount
//! in turn by every channel derived from the mount point. The registry
//! keeps the mount reachable for later attaches on the same transport and
//! retires it once no channel holds it and no one outside the mount holds
//! the transport.
//!
//! Tags stay assigned to a request record across free-list recycling and
//! are returned to the bitmap only when the record is dropped past the
//! free-list cap.

use crate::fcall::*;
use crate::mntio::BlockQueue;
use crate::transport::Transport;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{Mutex as AsyncMutex, Notify};

const TAGSHIFT: usize = 5;
const TAGMASK: u16 = (1 << TAGSHIFT) - 1;
const NMASK: usize = (64 * 1024) >> TAGSHIFT;

/// Free-list cap; records dropped past it release their tag
const NRPCFREE_MAX: usize = 32;

/// 16-bit tag space as a bitmap, with 0 and NOTAG pre-reserved
pub(crate) struct TagPool {
    mask: Vec<u32>,
}

impl TagPool {
    fn new() -> TagPool {
        let mut mask = vec![0u32; NMASK];
        mask[0] = 1; // don't allow 0 as a tag
        mask[NMASK - 1] = 0x8000_0000; // don't allow NOTAG
        TagPool { mask }
    }

    /// Claim the lowest clear bit. Panics when the space is exhausted.
    pub(crate) fn alloc(&mut self) -> u16 {
        for (i, w) in self.mask.iter_mut().enumerate() {
            if *w == u32::MAX {
                continue;
            }
            let j = (!*w).trailing_zeros() as usize;
            *w |= 1 << j;
            return ((i << TAGSHIFT) | j) as u16;
        }
        panic!("no free tags");
    }

    pub(crate) fn free(&mut self, t: u16) {
        self.mask[(t >> TAGSHIFT) as usize] &= !(1u32 << (t & TAGMASK));
    }

    #[cfg(test)]
    fn is_claimed(&self, t: u16) -> bool {
        self.mask[(t >> TAGSHIFT) as usize] & (1u32 << (t & TAGMASK)) != 0
    }
}

/// One outstanding request
pub(crate) struct Mntrpc {
    /// Tag assigned at record creation; kept across recycling
    pub(crate) tag: u16,
    /// Rendezvous the owning caller sleeps on
    pub(crate) z: Notify,
    done: AtomicBool,
    pub(crate) state: Mutex<RpcState>,
}

pub(crate) struct RpcState {
    /// Outgoing file system protocol message
    pub(crate) request: Msg,
    /// Incoming reply; None until delivered
    pub(crate) reply: Option<Msg>,
    /// Reply data blocks (Rread payload), detached from the frame
    pub(crate) b: Vec<Bytes>,
    /// Request this one flushes
    pub(crate) flushed: Option<Arc<Mntrpc>>,
}

impl Mntrpc {
    fn new(tag: u16) -> Mntrpc {
        Mntrpc {
            tag,
            z: Notify::new(),
            done: AtomicBool::new(false),
            state: Mutex::new(RpcState {
                request: Msg::from_body(tag, Fcall::Tflush { oldtag: 0 }),
                reply: None,
                b: Vec::new(),
                flushed: None,
            }),
        }
    }

    pub(crate) fn done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Only ever called with the mount lock held
    pub(crate) fn set_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub(crate) fn set_request(&self, body: Fcall) {
        let mut st = self.state.lock().unwrap();
        st.request = Msg::from_body(self.tag, body);
    }

    pub(crate) fn request_type(&self) -> MsgType {
        self.state.lock().unwrap().request.typ
    }
}

/// A live 9P session over one transport
///
/// NOTE: Defined as `Mnt` in portdat.h of Plan 9
pub(crate) struct Mnt {
    /// Monotonically assigned, nonzero
    pub(crate) id: u32,
    /// Protocol version negotiated at Tversion time
    pub(crate) version: String,
    /// Maximum bytes per 9P message on this session
    pub(crate) msize: u32,
    /// Transport to the file server
    pub(crate) c: Arc<dyn Transport>,
    /// Waiter list and reader slot
    pub(crate) lk: Mutex<MntMux>,
    /// Byte-block queue reassembling incoming frames; only the current
    /// reader touches it
    pub(crate) q: AsyncMutex<BlockQueue>,
}

pub(crate) struct MntMux {
    /// Outstanding rpcs awaiting their replies
    pub(crate) queue: Vec<Arc<Mntrpc>>,
    /// Whether some caller currently drains the transport
    pub(crate) rip: bool,
}

impl Mnt {
    pub(crate) fn new(id: u32, version: String, msize: u32, c: Arc<dyn Transport>) -> Mnt {
        Mnt {
            id,
            version,
            msize,
            c,
            lk: Mutex::new(MntMux {
                queue: Vec::new(),
                rip: false,
            }),
            q: AsyncMutex::new(BlockQueue::new()),
        }
    }

    /// Mark an unanswered rpc flushed and take it off the waiter list.
    ///
    /// The check and the Rflush marker are a single step under the mount
    /// lock, so a reply racing in from the transport either lands before
    /// this (rpc done, untouched here) or finds the rpc gone from the
    /// queue and is dropped as an orphan.
    pub(crate) fn qrm_flushed(&self, r: &Arc<Mntrpc>) -> bool {
        let mut mux = self.lk.lock().unwrap();
        if r.done() {
            return false;
        }
        {
            let mut st = r.state.lock().unwrap();
            st.reply = Some(Msg::from_body(r.tag, Fcall::Rflush));
        }
        r.set_done();
        mux.queue.retain(|q| !Arc::ptr_eq(q, r));
        true
    }
}

/// Process-wide allocator state: tag bitmap, rpc free list, mount registry
pub(crate) struct Mntalloc {
    lk: Mutex<MntallocInner>,
    /// Serializes first-time version negotiation (see client::version)
    pub(crate) vlk: AsyncMutex<()>,
}

struct MntallocInner {
    tags: TagPool,
    rpcfree: Vec<Arc<Mntrpc>>,
    nrpcused: usize,
    /// Seed for mount ids and channel device ids
    id: u32,
    next_fid: u32,
    mounts: Vec<Arc<Mnt>>,
}

/// A mount is done for once no channel holds it and nothing outside the
/// mount itself holds its transport
fn mount_live(m: &Arc<Mnt>) -> bool {
    Arc::strong_count(m) > 1 || Arc::strong_count(&m.c) > 1
}

pub(crate) fn mntalloc() -> &'static Mntalloc {
    static MNTALLOC: OnceLock<Mntalloc> = OnceLock::new();
    MNTALLOC.get_or_init(Mntalloc::new)
}

impl Mntalloc {
    pub(crate) fn new() -> Mntalloc {
        Mntalloc {
            lk: Mutex::new(MntallocInner {
                tags: TagPool::new(),
                rpcfree: Vec::new(),
                nrpcused: 0,
                id: 1,
                next_fid: 1,
                mounts: Vec::new(),
            }),
            vlk: AsyncMutex::new(()),
        }
    }

    /// Take a cleared rpc record, recycling one off the free list when
    /// possible. Recycled records keep the tag assigned at creation time.
    pub(crate) fn ralloc(&self) -> Arc<Mntrpc> {
        let r = {
            let mut a = self.lk.lock().unwrap();
            let r = match a.rpcfree.pop() {
                Some(r) => r,
                None => {
                    let tag = a.tags.alloc();
                    Arc::new(Mntrpc::new(tag))
                }
            };
            a.nrpcused += 1;
            r
        };
        r.done.store(false, Ordering::Release);
        {
            let mut st = r.state.lock().unwrap();
            st.reply = None;
            st.b.clear();
            st.flushed = None;
        }
        r
    }

    /// Release a record once the caller has observed its result
    pub(crate) fn rfree(&self, r: Arc<Mntrpc>) {
        {
            let mut st = r.state.lock().unwrap();
            st.b.clear();
            debug_assert!(st.flushed.is_none());
        }
        let mut a = self.lk.lock().unwrap();
        a.nrpcused -= 1;
        if a.rpcfree.len() < NRPCFREE_MAX {
            a.rpcfree.push(r);
            return;
        }
        a.tags.free(r.tag);
    }

    pub(crate) fn next_id(&self) -> u32 {
        let mut a = self.lk.lock().unwrap();
        let id = a.id;
        a.id += 1;
        id
    }

    pub(crate) fn next_fid(&self) -> u32 {
        let mut a = self.lk.lock().unwrap();
        let fid = a.next_fid;
        a.next_fid += 1;
        fid
    }

    /// Find the live mount bound to this transport, retiring mounts whose
    /// transport and channels are all gone
    pub(crate) fn lookup_mount(&self, c: &Arc<dyn Transport>) -> Option<Arc<Mnt>> {
        let mut a = self.lk.lock().unwrap();
        a.mounts.retain(mount_live);
        a.mounts.iter().find(|m| Arc::ptr_eq(&m.c, c)).cloned()
    }

    pub(crate) fn install_mount(&self, m: &Arc<Mnt>) {
        let mut a = self.lk.lock().unwrap();
        a.mounts.retain(mount_live);
        a.mounts.push(m.clone());
    }

    #[cfg(test)]
    fn nrpcfree(&self) -> usize {
        self.lk.lock().unwrap().rpcfree.len()
    }

    #[cfg(test)]
    fn tag_claimed(&self, t: u16) -> bool {
        self.lk.lock().unwrap().tags.is_claimed(t)
    }
}

/// Create a flush request chained onto the rpc it cancels.
///
/// A flush of a flush carries the original oldtag forward, so arbitrarily
/// long chains still name the first request.
pub(crate) fn mntflushalloc(alloc: &Mntalloc, r: &Arc<Mntrpc>) -> Arc<Mntrpc> {
    let fr = alloc.ralloc();
    let oldtag = {
        let st = r.state.lock().unwrap();
        match st.request.body {
            Fcall::Tflush { oldtag } => oldtag,
            _ => r.tag,
        }
    };
    fr.set_request(Fcall::Tflush { oldtag });
    fr.state.lock().unwrap().flushed = Some(r.clone());
    fr
}

/// Unwind a chain of flushes. Each unanswered element is marked Rflush and
/// removed from the waiter list; the flushes themselves are freed. Returns
/// the original request, whose Rflush marker (if it never got a real
/// reply) makes mountrpc report an interrupt.
pub(crate) fn mntflushfree(alloc: &Mntalloc, m: &Mnt, r: Arc<Mntrpc>) -> Arc<Mntrpc> {
    let mut r = r;
    loop {
        let fr = r.state.lock().unwrap().flushed.take();
        m.qrm_flushed(&r);
        match fr {
            Some(next) => {
                alloc.rfree(r);
                r = next;
            }
            None => return r,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_allocate_lowest_first() {
        let mut pool = TagPool::new();
        assert_eq!(pool.alloc(), 1); // 0 is reserved
        assert_eq!(pool.alloc(), 2);
        assert_eq!(pool.alloc(), 3);
        pool.free(2);
        assert_eq!(pool.alloc(), 2);
    }

    #[test]
    fn tag_space_excludes_reserved_values() {
        let mut pool = TagPool::new();
        let mut last = 0;
        for _ in 0..(64 * 1024 - 2) {
            let t = pool.alloc();
            assert_ne!(t, 0);
            assert_ne!(t, NOTAG);
            last = t;
        }
        assert_eq!(last, NOTAG - 1);
    }

    #[test]
    #[should_panic(expected = "no free tags")]
    fn tag_saturation_panics() {
        let mut pool = TagPool::new();
        for _ in 0..(64 * 1024 - 2) {
            pool.alloc();
        }
        pool.alloc();
    }

    #[test]
    fn tag_free_unblocks_saturated_pool() {
        let mut pool = TagPool::new();
        for _ in 0..(64 * 1024 - 2) {
            pool.alloc();
        }
        pool.free(77);
        assert_eq!(pool.alloc(), 77);
    }

    #[test]
    fn recycled_records_keep_their_tag() {
        let alloc = Mntalloc::new();
        let r = alloc.ralloc();
        let tag = r.tag;
        alloc.rfree(r);
        let r = alloc.ralloc();
        assert_eq!(r.tag, tag);
        alloc.rfree(r);
    }

    #[test]
    fn live_tags_are_unique() {
        let alloc = Mntalloc::new();
        let rpcs: Vec<_> = (0..10).map(|_| alloc.ralloc()).collect();
        for (i, a) in rpcs.iter().enumerate() {
            for b in rpcs.iter().skip(i + 1) {
                assert_ne!(a.tag, b.tag);
            }
        }
        for r in rpcs {
            alloc.rfree(r);
        }
    }

    #[test]
    fn overflowing_the_free_list_releases_tags() {
        let alloc = Mntalloc::new();
        let rpcs: Vec<_> = (0..NRPCFREE_MAX + 8).map(|_| alloc.ralloc()).collect();
        let tags: Vec<u16> = rpcs.iter().map(|r| r.tag).collect();
        for r in rpcs {
            alloc.rfree(r);
        }
        assert_eq!(alloc.nrpcfree(), NRPCFREE_MAX);
        // the first NRPCFREE_MAX frees were pooled with tags intact,
        // the remainder released their tags
        for t in &tags[..NRPCFREE_MAX] {
            assert!(alloc.tag_claimed(*t));
        }
        for t in &tags[NRPCFREE_MAX..] {
            assert!(!alloc.tag_claimed(*t));
        }
    }

    #[test]
    fn flush_chains_collapse_to_the_original_tag() {
        let alloc = Mntalloc::new();
        let r = alloc.ralloc();
        r.set_request(Fcall::Tread {
            fid: 1,
            offset: 0,
            count: 128,
        });

        let f1 = mntflushalloc(&alloc, &r);
        let f2 = mntflushalloc(&alloc, &f1);
        match f1.state.lock().unwrap().request.body {
            Fcall::Tflush { oldtag } => assert_eq!(oldtag, r.tag),
            ref other => panic!("not a flush: {:?}", other),
        }
        match f2.state.lock().unwrap().request.body {
            Fcall::Tflush { oldtag } => assert_eq!(oldtag, r.tag),
            ref other => panic!("not a flush: {:?}", other),
        };
    }
}
