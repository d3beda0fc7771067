
//! Operation layer of the mount driver
//!
//! Presents filesystem-style channels over a shared 9P transport: version
//! negotiation creates the mount, attach/auth derive channels from it, and
//! the channel operations build one rpc each and drive it through the
//! request engine. Stat and directory reads rewrite the leading device
//! fields of every Dir entry so readdir output is consistent with the
//! local namespace rather than the server's.

use crate::error::{string, Error, Result};
use crate::fcall::*;
use crate::mnt::{mntalloc, Mnt, Mntrpc};
use crate::mntio::mountrpc;
use crate::serialize::{self, Decodable, Encodable};
use crate::transport::{Intr, Transport};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Bytes, BytesMut};
use std::io::Cursor;
use std::sync::Arc;

/// Device class of channels served by the mount driver
pub const DEVMNT: u16 = b'M' as u16;

bitflags! {
    /// Channel state bits
    pub(crate) struct CFlag: u32 {
        /// Open for i/o
        const OPEN  = 0x0001;
        /// Client cache hint
        const CACHE = 0x0004;
    }
}

bitflags! {
    /// Mount/attach option flags
    pub struct MntFlags: u32 {
        /// Cache some data from this tree locally (stored as an opaque
        /// hint on the channel)
        const CACHE = 0x0001;
    }
}

impl std::fmt::Debug for Chan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chan")
            .field("fid", &self.fid)
            .field("dev", &self.dev)
            .field("qid", &self.qid)
            .field("mqid", &self.mqid)
            .field("mode", &self.mode)
            .field("iounit", &self.iounit)
            .field("flags", &self.flags)
            .finish()
    }
}

/// A local channel onto a file of a mounted 9P tree
pub struct Chan {
    m: Arc<Mnt>,
    fid: u32,
    /// Local device number distinguishing attach points
    dev: u32,
    qid: Qid,
    /// Qid the channel was attached at
    mqid: Qid,
    mode: u8,
    iounit: u32,
    flags: CFlag,
}

/// Result of a walk: the new channel, if the whole path was walked, and
/// the qids of the elements that were
pub struct Walkqid {
    pub clone: Option<Chan>,
    pub qids: Vec<Qid>,
}

fn emountrpc() -> Error {
    Error::Proto(string::EMOUNTRPC.to_owned())
}

fn esbadstat() -> Error {
    Error::Proto(string::ESBADSTAT.to_owned())
}

/// Negotiate the protocol version on a fresh transport, or verify a
/// caller's version against the one already established there.
///
/// Version is not multiplexed: the Tversion/Rversion pair is exchanged
/// inline on the transport, once per connection, before any mux exists.
/// Returns the version string in effect.
pub async fn version(
    c: &Arc<dyn Transport>,
    requested: Option<&str>,
    msize: u32,
    intr: &Intr,
) -> Result<String> {
    let alloc = mntalloc();
    // make sure no one else negotiates until we've established ourselves
    let _vguard = alloc.vlk.lock().await;
    let seen = intr.count();

    // defaults
    let msize = if msize == 0 { MAXRPC } else { msize };
    let v = match requested {
        Some(s) if !s.is_empty() => s,
        _ => VERSION9P,
    };

    // validity
    if msize < 256 || msize > 1024 * 1024 {
        return Err(Error::Proto("bad iounit in version call".to_owned()));
    }
    if !v.starts_with("9P") {
        return Err(Error::Proto("bad 9P version specification".to_owned()));
    }

    if let Some(m) = alloc.lookup_mount(c) {
        // negotiated before; the established version must be a prefix of
        // the requested one
        if !v.starts_with(m.version.as_str()) {
            return Err(Error::Proto(format!(
                "incompatible 9P versions {} {}",
                m.version, v
            )));
        }
        return Ok(m.version.clone());
    }

    let f = Msg::from_body(
        NOTAG,
        Fcall::Tversion {
            msize,
            version: v.to_owned(),
        },
    );
    let mut msg = Vec::new();
    let k = serialize::write_msg(&mut msg, &f)
        .map_err(|_| Error::Proto("bad fversion conversion on send".to_owned()))?;
    if k > MAXRPC0 as usize {
        return Err(Error::Proto("bad fversion conversion on send".to_owned()));
    }
    let l = c.bwrite(Bytes::from(msg)).await?;
    if l < k {
        return Err(Error::Proto("short write in fversion".to_owned()));
    }

    // message sent; receive and decode the reply
    let mut buf = BytesMut::new();
    loop {
        if buf.len() >= 4 {
            let want = LittleEndian::read_u32(&buf[..4]) as usize;
            if buf.len() >= want || buf.len() >= MAXRPC0 as usize {
                break;
            }
        }
        let b = tokio::select! {
            res = c.bread(MAXRPC0) => res,
            _ = intr.wait(seen) => return Err(Error::Intr),
        };
        let b = match b {
            Ok(b) if !b.is_empty() => b,
            Ok(_) | Err(Error::Hungup) => {
                return Err(Error::Proto("EOF receiving fversion reply".to_owned()))
            }
            Err(e) => return Err(e),
        };
        buf.extend_from_slice(&b);
    }

    let k = buf.len();
    let mut cur = Cursor::new(&buf[..]);
    let f = serialize::read_msg(&mut cur)
        .map_err(|_| Error::Proto("bad fversion conversion on reply".to_owned()))?;
    if cur.position() as usize != k {
        return Err(Error::Proto("bad fversion conversion on reply".to_owned()));
    }
    let (rmsize, rversion) = match f.body {
        Fcall::Rversion { msize, version } => (msize, version),
        Fcall::Rerror { ename } => return Err(Error::Server(ename)),
        _ => return Err(Error::Proto("unexpected reply type in fversion".to_owned())),
    };
    if rmsize > msize {
        return Err(Error::Proto(
            "server tries to increase msize in fversion".to_owned(),
        ));
    }
    if rmsize < 256 || rmsize > 1024 * 1024 {
        return Err(Error::Proto(
            "nonsense value of msize in fversion".to_owned(),
        ));
    }
    if rversion.is_empty() || !v.starts_with(rversion.as_str()) {
        return Err(Error::Proto(
            "bad 9P version returned from server".to_owned(),
        ));
    }

    // now build the mount associated with this connection
    let m = Arc::new(Mnt::new(
        alloc.next_id(),
        rversion.clone(),
        rmsize,
        c.clone(),
    ));
    alloc.install_mount(&m);
    debug!("mnt: mount {} established, version {} msize {}", m.id, m.version, m.msize);

    Ok(rversion)
}

async fn mount_for(c: &Arc<dyn Transport>, intr: &Intr) -> Result<Arc<Mnt>> {
    let alloc = mntalloc();
    if let Some(m) = alloc.lookup_mount(c) {
        return Ok(m);
    }
    version(c, None, 0, intr).await?;
    alloc
        .lookup_mount(c)
        .ok_or_else(|| Error::Proto(string::ENOVERSION.to_owned()))
}

fn mntchan(m: &Arc<Mnt>) -> Chan {
    let alloc = mntalloc();
    Chan {
        m: m.clone(),
        fid: alloc.next_fid(),
        dev: alloc.next_id(),
        qid: Qid::default(),
        mqid: Qid::default(),
        mode: 0,
        iounit: 0,
        flags: CFlag::empty(),
    }
}

/// Free the rpc record and hand back the reply body
fn rpcreply(r: Arc<Mntrpc>, res: Result<()>) -> Result<Fcall> {
    let out = match res {
        Ok(()) => r
            .state
            .lock()
            .unwrap()
            .reply
            .take()
            .map(|m| m.body)
            .ok_or_else(emountrpc),
        Err(e) => Err(e),
    };
    mntalloc().rfree(r);
    out
}

/// Obtain an authentication channel for later use as the afid of an
/// attach. The channel is open for read/write against the server's
/// authentication file.
pub async fn auth(
    c: &Arc<dyn Transport>,
    uname: &str,
    aname: &str,
    intr: &Intr,
) -> Result<Chan> {
    let m = mount_for(c, intr).await?;
    let mut nc = mntchan(&m);

    let r = mntalloc().ralloc();
    r.set_request(Fcall::Tauth {
        afid: nc.fid,
        uname: uname.to_owned(),
        aname: aname.to_owned(),
    });
    let res = mountrpc(&m, &r, intr).await;
    match rpcreply(r, res)? {
        Fcall::Rauth { aqid } => {
            nc.qid = aqid;
            nc.mqid = aqid;
            nc.mode = om::RDWR;
            nc.iounit = m.msize - IOHDRSZ;
            Ok(nc)
        }
        _ => Err(emountrpc()),
    }
}

/// Attach to the file tree named by `aname`, returning a channel on its
/// root. `ac`, if given, must be an auth channel previously obtained on
/// the same transport. Negotiates the version with defaults first when
/// the transport has no mount yet.
pub async fn attach(
    c: &Arc<dyn Transport>,
    ac: Option<&Chan>,
    uname: &str,
    aname: &str,
    flags: MntFlags,
    intr: &Intr,
) -> Result<Chan> {
    if let Some(ac) = ac {
        if !Arc::ptr_eq(&ac.m.c, c) {
            return Err(Error::Proto(string::EBADUSEFD.to_owned()));
        }
    }
    let m = mount_for(c, intr).await?;
    let mut nc = mntchan(&m);

    let r = mntalloc().ralloc();
    r.set_request(Fcall::Tattach {
        fid: nc.fid,
        afid: ac.map_or(NOFID, |a| a.fid),
        uname: uname.to_owned(),
        aname: aname.to_owned(),
    });
    let res = mountrpc(&m, &r, intr).await;
    match rpcreply(r, res)? {
        Fcall::Rattach { qid } => {
            nc.qid = qid;
            nc.mqid = qid;
            nc.iounit = m.msize - IOHDRSZ;
            if flags.contains(MntFlags::CACHE) {
                nc.flags |= CFlag::CACHE;
            }
            Ok(nc)
        }
        _ => Err(emountrpc()),
    }
}

impl Chan {
    pub fn fid(&self) -> u32 {
        self.fid
    }

    pub fn qid(&self) -> Qid {
        self.qid
    }

    pub fn mqid(&self) -> Qid {
        self.mqid
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn iounit(&self) -> u32 {
        self.iounit
    }

    pub fn mode(&self) -> u8 {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.flags.contains(CFlag::OPEN)
    }

    /// Walk from this channel through `names`, at most MAXWELEM elements.
    ///
    /// A clone fid is allocated for the destination. On a partial walk the
    /// server never accepted the clone fid, so the clone is discarded
    /// locally (no clunk) and only the walked qids are returned.
    pub async fn walk(&self, names: &[&str], intr: &Intr) -> Result<Walkqid> {
        if names.len() > MAXWELEM {
            return Err(Error::Proto("mnt: too many name elements".to_owned()));
        }
        let mut nc = mntchan(&self.m);
        nc.qid = self.qid;
        nc.mqid = self.mqid;
        nc.iounit = self.iounit;
        nc.flags = self.flags & CFlag::CACHE;

        let r = mntalloc().ralloc();
        r.set_request(Fcall::Twalk {
            fid: self.fid,
            newfid: nc.fid,
            wnames: names.iter().map(|s| (*s).to_owned()).collect(),
        });
        let res = mountrpc(&self.m, &r, intr).await;
        let wqids = match rpcreply(r, res)? {
            Fcall::Rwalk { wqids } => wqids,
            _ => return Err(emountrpc()),
        };

        if wqids.len() > names.len() {
            return Err(Error::Proto("too many QIDs returned by walk".to_owned()));
        }
        if wqids.len() < names.len() {
            if wqids.is_empty() {
                return Err(Error::Proto("walk returned no QIDs".to_owned()));
            }
            return Ok(Walkqid {
                clone: None,
                qids: wqids,
            });
        }
        if let Some(q) = wqids.last() {
            nc.qid = *q;
        }
        Ok(Walkqid {
            clone: Some(nc),
            qids: wqids,
        })
    }

    pub async fn open(&mut self, omode: u8, intr: &Intr) -> Result<()> {
        self.opencreate(None, omode, 0, intr).await
    }

    pub async fn create(&mut self, name: &str, omode: u8, perm: u32, intr: &Intr) -> Result<()> {
        self.opencreate(Some(name), omode, perm, intr).await
    }

    async fn opencreate(
        &mut self,
        name: Option<&str>,
        omode: u8,
        perm: u32,
        intr: &Intr,
    ) -> Result<()> {
        let r = mntalloc().ralloc();
        match name {
            Some(name) => r.set_request(Fcall::Tcreate {
                fid: self.fid,
                name: name.to_owned(),
                perm,
                mode: omode,
            }),
            None => r.set_request(Fcall::Topen {
                fid: self.fid,
                mode: omode,
            }),
        }
        let res = mountrpc(&self.m, &r, intr).await;
        let (qid, iounit) = match rpcreply(r, res)? {
            Fcall::Ropen { qid, iounit } => (qid, iounit),
            Fcall::Rcreate { qid, iounit } => (qid, iounit),
            _ => return Err(emountrpc()),
        };
        self.qid = qid;
        self.mode = omode;
        self.iounit = iounit;
        if self.iounit == 0 || self.iounit > self.m.msize - IOHDRSZ {
            self.iounit = self.m.msize - IOHDRSZ;
        }
        self.flags |= CFlag::OPEN;
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `off`, chunking requests by the
    /// channel's iounit and gathering each reply's block chain. The loop
    /// ends when the caller's count is satisfied or the server returns a
    /// short reply. Directory payloads are validated entry by entry and
    /// rewritten to local device values.
    pub async fn read(&self, buf: &mut [u8], off: u64, intr: &Intr) -> Result<usize> {
        let alloc = mntalloc();
        let mut off = off;
        let mut cnt = 0usize;

        loop {
            let nreq = (buf.len() - cnt).min(self.iounit as usize);
            let r = alloc.ralloc();
            r.set_request(Fcall::Tread {
                fid: self.fid,
                offset: off,
                count: nreq as u32,
            });
            match mountrpc(&self.m, &r, intr).await {
                Ok(()) => {}
                Err(e) => {
                    alloc.rfree(r);
                    return Err(e);
                }
            }
            let nr = {
                let mut st = r.state.lock().unwrap();
                let mut copied = 0usize;
                for b in st.b.iter() {
                    let take = b.len().min(nreq - copied);
                    buf[cnt + copied..cnt + copied + take].copy_from_slice(&b[..take]);
                    copied += take;
                    if copied == nreq {
                        break;
                    }
                }
                st.b.clear();
                st.reply = None;
                copied
            };
            alloc.rfree(r);

            off += nr as u64;
            cnt += nr;
            if nr != nreq || cnt == buf.len() {
                break;
            }
        }

        if self.qid.typ & qt::DIR != 0 {
            self.dirfix_all(&mut buf[..cnt])?;
        }
        Ok(cnt)
    }

    /// Write `buf` at `off`, chunking by the channel's iounit. Stops early
    /// if the server accepts fewer bytes than offered.
    pub async fn write(&self, buf: &[u8], off: u64, intr: &Intr) -> Result<usize> {
        let alloc = mntalloc();
        let mut off = off;
        let mut cnt = 0usize;

        loop {
            let nreq = (buf.len() - cnt).min(self.iounit as usize);
            let r = alloc.ralloc();
            r.set_request(Fcall::Twrite {
                fid: self.fid,
                offset: off,
                data: Data::new(buf[cnt..cnt + nreq].to_vec()),
            });
            let res = mountrpc(&self.m, &r, intr).await;
            let count = match rpcreply(r, res)? {
                Fcall::Rwrite { count } => count as usize,
                _ => return Err(emountrpc()),
            };
            let nr = count.min(nreq);

            off += nr as u64;
            cnt += nr;
            if nr != nreq || cnt == buf.len() {
                break;
            }
        }
        Ok(cnt)
    }

    /// Stat the file into `buf` in wire form, with the device fields
    /// rewritten to local values.
    ///
    /// If the entry does not fit, only its 2-byte size field is stored and
    /// 2 is returned, so the caller can retry with a large enough buffer.
    pub async fn stat(&self, buf: &mut [u8], intr: &Intr) -> Result<usize> {
        if buf.len() < 2 {
            return Err(Error::Proto(string::ESHORTSTAT.to_owned()));
        }
        let r = mntalloc().ralloc();
        r.set_request(Fcall::Tstat { fid: self.fid });
        let res = mountrpc(&self.m, &r, intr).await;
        let stat = match rpcreply(r, res)? {
            Fcall::Rstat { stat } => stat,
            _ => return Err(emountrpc()),
        };

        let nstat = stat.size() as usize + 2;
        if nstat > buf.len() {
            LittleEndian::write_u16(&mut buf[..2], stat.size());
            return Ok(2);
        }
        stat.encode(&mut Cursor::new(&mut buf[..]))?;
        validstat(&buf[..nstat])?;
        mntdirfix(&mut buf[..nstat], self);
        Ok(nstat)
    }

    /// Typed convenience over `stat`
    pub async fn dirstat(&self, intr: &Intr) -> Result<Stat> {
        let mut buf = vec![0u8; self.m.msize as usize];
        let n = self.stat(&mut buf[..], intr).await?;
        if n == 2 {
            return Err(Error::Proto(string::ESHORTSTAT.to_owned()));
        }
        Ok(Stat::decode(&mut Cursor::new(&buf[..n]))?)
    }

    pub async fn wstat(&self, stat: &Stat, intr: &Intr) -> Result<()> {
        let r = mntalloc().ralloc();
        r.set_request(Fcall::Twstat {
            fid: self.fid,
            stat: stat.clone(),
        });
        let res = mountrpc(&self.m, &r, intr).await;
        match rpcreply(r, res)? {
            Fcall::Rwstat => Ok(()),
            _ => Err(emountrpc()),
        }
    }

    /// Give the fid back to the server
    pub async fn clunk(&mut self, intr: &Intr) -> Result<()> {
        self.mntclunk(false, intr).await
    }

    /// Remove the file and clunk the fid
    pub async fn remove(&mut self, intr: &Intr) -> Result<()> {
        self.mntclunk(true, intr).await
    }

    async fn mntclunk(&mut self, remove: bool, intr: &Intr) -> Result<()> {
        let r = mntalloc().ralloc();
        if remove {
            r.set_request(Fcall::Tremove { fid: self.fid });
        } else {
            r.set_request(Fcall::Tclunk { fid: self.fid });
        }
        let res = mountrpc(&self.m, &r, intr).await;
        let res = rpcreply(r, res).map(|_| ());
        match res {
            Ok(()) => {
                self.fid = 0;
                self.flags.remove(CFlag::OPEN);
                Ok(())
            }
            Err(e) => {
                // the server believes the fid is gone unless the whole
                // connection died under us
                if !e.is_hungup() {
                    self.fid = 0;
                }
                Err(e)
            }
        }
    }

    fn dirfix_all(&self, buf: &mut [u8]) -> Result<()> {
        let e = buf.len();
        let mut p = 0usize;
        while p + 2 < e {
            let dirlen = 2 + LittleEndian::read_u16(&buf[p..p + 2]) as usize;
            if p + dirlen > e {
                break;
            }
            validstat(&buf[p..p + dirlen])?;
            mntdirfix(&mut buf[p..p + dirlen], self);
            p += dirlen;
        }
        if p != e {
            return Err(esbadstat());
        }
        Ok(())
    }
}

/// Rewrite channel type and dev of in-flight directory data to reflect
/// local values. These are known to be the first two fields in the Dir
/// encoding after the count.
fn mntdirfix(dirbuf: &mut [u8], c: &Chan) {
    LittleEndian::write_u16(&mut dirbuf[2..4], DEVMNT);
    LittleEndian::write_u32(&mut dirbuf[4..8], c.dev);
}

/// Check that a serialized Dir entry is well formed: the fixed fields and
/// four counted strings must exactly fill the declared size.
fn validstat(buf: &[u8]) -> Result<()> {
    if buf.len() < 2 {
        return Err(esbadstat());
    }
    let size = LittleEndian::read_u16(&buf[..2]) as usize;
    if size + 2 != buf.len() {
        return Err(esbadstat());
    }
    // type[2] dev[4] qid[13] mode[4] atime[4] mtime[4] length[8]
    let mut p = 2 + 39;
    if p > buf.len() {
        return Err(esbadstat());
    }
    for _ in 0..4 {
        if p + 2 > buf.len() {
            return Err(esbadstat());
        }
        let n = LittleEndian::read_u16(&buf[p..p + 2]) as usize;
        p += 2 + n;
        if p > buf.len() {
            return Err(esbadstat());
        }
    }
    if p != buf.len() {
        return Err(esbadstat());
    }
    Ok(())
}
