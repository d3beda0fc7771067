
//! Request engine and reply demultiplexer
//!
//! Callers on one mount share its transport by interleaving tagged
//! request/reply pairs. A request is transmitted, then its caller either
//! becomes the mount's single reader and pumps replies off the transport,
//! or parks on its own rendezvous until some other reader delivers its
//! reply. Cancellation turns into the Tflush protocol: the interrupted
//! caller chains a flush onto its request and drives that instead.

use crate::error::{string, Error, Result};
use crate::fcall::*;
use crate::mnt::{mntalloc, mntflushalloc, mntflushfree, Mnt, Mntrpc};
use crate::serialize;
use crate::transport::Intr;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Arc;

/// size[4] type[1] tag[2]
const MSGHDRSZ: usize = 7;
/// size[4] type[1] tag[2] count[4]
const RREADHDRSZ: usize = 11;

fn emountrpc() -> Error {
    Error::Proto(string::EMOUNTRPC.to_owned())
}

/// Byte-block queue reassembling 9P frames off the transport
pub(crate) struct BlockQueue {
    blocks: VecDeque<Bytes>,
    len: usize,
}

impl BlockQueue {
    pub(crate) fn new() -> BlockQueue {
        BlockQueue {
            blocks: VecDeque::new(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn add(&mut self, b: Bytes) {
        self.len += b.len();
        self.blocks.push_back(b);
    }

    /// Make the first block hold at least `n` bytes, merging fronts as
    /// needed. Queue length is unchanged.
    pub(crate) fn pullup(&mut self, n: usize) -> Option<&Bytes> {
        if self.len < n {
            return None;
        }
        if self.blocks.front().map_or(false, |b| b.len() >= n) {
            return self.blocks.front();
        }
        let mut merged = BytesMut::with_capacity(n);
        while merged.len() < n {
            let mut b = self.blocks.pop_front()?;
            let take = b.len().min(n - merged.len());
            merged.extend_from_slice(&b[..take]);
            let rest = b.split_off(take);
            if !rest.is_empty() {
                self.blocks.push_front(rest);
            }
        }
        self.blocks.push_front(merged.freeze());
        self.blocks.front()
    }

    pub(crate) fn remove(&mut self) -> Option<Bytes> {
        let b = self.blocks.pop_front()?;
        self.len -= b.len();
        Some(b)
    }

    pub(crate) fn putback(&mut self, b: Bytes) {
        self.len += b.len();
        self.blocks.push_front(b);
    }

    pub(crate) fn discard(&mut self, mut n: usize) {
        while n > 0 {
            let mut b = match self.remove() {
                Some(b) => b,
                None => return,
            };
            if b.len() > n {
                let rest = b.split_off(n);
                self.putback(rest);
                return;
            }
            n -= b.len();
        }
    }

    pub(crate) fn flush(&mut self) {
        self.blocks.clear();
        self.len = 0;
    }
}

/// Drive one rpc to completion and classify its reply
pub(crate) async fn mountrpc(m: &Arc<Mnt>, r: &Arc<Mntrpc>, intr: &Intr) -> Result<()> {
    {
        let mut st = r.state.lock().unwrap();
        st.reply = None;
        st.b.clear();
    }

    mountio(m, r, intr).await?;

    let st = r.state.lock().unwrap();
    match st.reply {
        Some(ref msg) => match msg.body {
            Fcall::Rerror { ref ename } => Err(Error::Server(ename.clone())),
            Fcall::Rflush => Err(Error::Intr),
            _ => {
                if msg.typ as u8 == st.request.typ as u8 + 1 {
                    Ok(())
                } else {
                    error!(
                        "mnt: mismatch rep tag {} fid? T{:?} R{:?}",
                        msg.tag, st.request.typ, msg.typ
                    );
                    Err(emountrpc())
                }
            }
        },
        None => Err(emountrpc()),
    }
}

/// Transmit the request and wait for its reply, converting interrupts into
/// chained flushes. A second interrupt while a flush is outstanding
/// abandons the chain.
pub(crate) async fn mountio(m: &Arc<Mnt>, r: &Arc<Mntrpc>, intr: &Intr) -> Result<()> {
    let alloc = mntalloc();
    let mut cur = r.clone();
    let mut seen = intr.count();
    let mut flushing = false;

    loop {
        match mountio1(m, &cur, intr, seen).await {
            Ok(()) => {
                mntflushfree(alloc, m, cur);
                return Ok(());
            }
            Err(e) => {
                let interrupted = matches!(e, Error::Intr);
                if !interrupted || flushing {
                    mntflushfree(alloc, m, cur);
                    return Err(e);
                }
                seen = intr.count();
                cur = mntflushalloc(alloc, &cur);
                flushing = true;
            }
        }
    }
}

/// One transmission round: enqueue, send, then either read for the whole
/// mount or sleep until a reader hands over the reply
async fn mountio1(m: &Arc<Mnt>, r: &Arc<Mntrpc>, intr: &Intr, seen: u64) -> Result<()> {
    {
        let mut mux = m.lk.lock().unwrap();
        mux.queue.push(r.clone());
    }

    // transmit a file system rpc
    let mut buf = Vec::new();
    let res = {
        let st = r.state.lock().unwrap();
        serialize::write_msg(&mut buf, &st.request)
    };
    match res {
        Ok(n) if n > 0 && n <= m.msize as usize => {}
        Ok(n) => {
            error!(
                "mountio: marshalled {} bytes for tag {} {:?}, msize {}",
                n,
                r.tag,
                r.request_type(),
                m.msize
            );
            return Err(emountrpc());
        }
        Err(e) => {
            error!("mountio: marshalling tag {} failed: {}", r.tag, e);
            return Err(emountrpc());
        }
    }
    m.c.bwrite(Bytes::from(buf)).await?;

    // gate readers onto the mount point one at a time
    loop {
        {
            let mut mux = m.lk.lock().unwrap();
            if r.done() {
                return Ok(());
            }
            if !mux.rip {
                mux.rip = true;
                break;
            }
        }
        tokio::select! {
            _ = r.z.notified() => {}
            _ = intr.wait(seen) => return Err(Error::Intr),
        }
        if r.done() {
            return Ok(());
        }
    }

    let res = drain(m, r, intr, seen).await;
    mntgate(m);
    res
}

async fn drain(m: &Arc<Mnt>, r: &Arc<Mntrpc>, intr: &Intr, seen: u64) -> Result<()> {
    while !r.done() {
        mntrpcread(m, r, intr, seen).await?;
        mountmux(m, r);
    }
    Ok(())
}

/// Vacate the reader slot and wake the next waiter, which will elect
/// itself reader if its reply has not arrived yet
pub(crate) fn mntgate(m: &Mnt) {
    let mut mux = m.lk.lock().unwrap();
    mux.rip = false;
    for q in mux.queue.iter() {
        if !q.done() {
            q.z.notify_one();
            break;
        }
    }
}

async fn doread(m: &Mnt, q: &mut BlockQueue, len: usize, intr: &Intr, seen: u64) -> Result<()> {
    while q.len() < len {
        let b = tokio::select! {
            res = m.c.bread(m.msize) => res?,
            _ = intr.wait(seen) => return Err(Error::Intr),
        };
        if b.is_empty() {
            return Err(Error::Hungup);
        }
        q.add(b);
    }
    Ok(())
}

/// Pull one framed reply off the transport into the rpc record.
///
/// The header prefix (the whole message, except that an Rread header stops
/// before the data) is pulled up contiguous and unmarshalled; the data
/// tail is detached as a block chain, splitting the block that straddles
/// the next message boundary.
pub(crate) async fn mntrpcread(m: &Mnt, r: &Arc<Mntrpc>, intr: &Intr, seen: u64) -> Result<()> {
    {
        let mut st = r.state.lock().unwrap();
        st.reply = None;
        st.b.clear();
    }

    let mut q = m.q.lock().await;

    // read at least length, type and tag
    doread(m, &mut q, MSGHDRSZ, intr, seen).await?;
    let (len, typ) = {
        let hdr = match q.pullup(MSGHDRSZ) {
            Some(h) => h,
            None => return Err(emountrpc()),
        };
        (LittleEndian::read_u32(&hdr[..4]) as usize, hdr[4])
    };
    if len < MSGHDRSZ || len > m.msize as usize {
        q.flush();
        return Err(emountrpc());
    }
    doread(m, &mut q, len, intr, seen).await?;

    // pull up the header, i.e. everything except read data
    let hlen = if typ == MsgType::Rread as u8 && len >= RREADHDRSZ {
        RREADHDRSZ
    } else {
        len
    };
    let header = match q.pullup(hlen) {
        Some(h) => h.clone(),
        None => return Err(emountrpc()),
    };

    let reply = if hlen == RREADHDRSZ && typ == MsgType::Rread as u8 {
        // the data stays off-message; the frame length governs the chain
        let tag = LittleEndian::read_u16(&header[5..7]);
        Msg {
            typ: MsgType::Rread,
            tag,
            body: Fcall::Rread {
                data: Data::new(Vec::new()),
            },
        }
    } else {
        match serialize::read_msg(&mut Cursor::new(&header[..hlen])) {
            Ok(msg) => msg,
            Err(e) => {
                // bad message, dump it
                error!("mntrpcread: unmarshal failed: {}", e);
                q.discard(len);
                return Err(emountrpc());
            }
        }
    };

    // hang the data off the rpc record
    let mut first = match q.remove() {
        Some(b) => b,
        None => return Err(emountrpc()),
    };
    let tail = first.split_off(hlen);
    let mut datalen = len - hlen;
    let mut chain: Vec<Bytes> = Vec::new();
    let mut b = tail;
    loop {
        if b.len() > datalen {
            // split the block and put the unused bit back
            let rest = b.split_off(datalen);
            q.putback(rest);
            if !b.is_empty() {
                chain.push(b);
            }
            break;
        }
        datalen -= b.len();
        if !b.is_empty() {
            chain.push(b);
        }
        if datalen == 0 {
            break;
        }
        b = match q.remove() {
            Some(nb) => nb,
            None => break,
        };
    }

    debug!("mnt: <- {:?} tag {}", reply.typ, reply.tag);
    let mut st = r.state.lock().unwrap();
    st.reply = Some(reply);
    st.b = chain;
    Ok(())
}

/// Deliver a freshly read reply to the waiter whose tag matches
pub(crate) fn mountmux(m: &Mnt, r: &Arc<Mntrpc>) {
    let tag = match r.state.lock().unwrap().reply {
        Some(ref msg) => msg.tag,
        None => return,
    };

    let mut mux = m.lk.lock().unwrap();
    if let Some(pos) = mux.queue.iter().position(|q| q.tag == tag) {
        let q = mux.queue.remove(pos);
        if Arc::ptr_eq(&q, r) {
            q.set_done();
            return;
        }
        // completed someone else; trade the receive buffers over
        {
            let mut rst = r.state.lock().unwrap();
            let mut qst = q.state.lock().unwrap();
            qst.reply = rst.reply.take();
            qst.b = std::mem::take(&mut rst.b);
        }
        q.set_done();
        q.z.notify_one();
        return;
    }
    drop(mux);
    // an orphan reply has no effect beyond this diagnostic
    warn!("unexpected reply tag {}; type {}", tag, typ_of(r));
}

fn typ_of(r: &Mntrpc) -> u8 {
    r.state
        .lock()
        .unwrap()
        .reply
        .as_ref()
        .map(|m| m.typ as u8)
        .unwrap_or(0)
}
