
//! Serialize and deserialize 9P messages into and from binary

use crate::fcall::*;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{self, Cursor, Read};
use std::mem;

macro_rules! io_error {
    ($kind:ident, $msg:expr) => {
        Err(io::Error::new(io::ErrorKind::$kind, $msg))
    };
}

macro_rules! encode {
    ( $encoder:expr, $( $x:expr ),* ) => {
        $( $x.encode(&mut $encoder)?; )*
    }
}

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };
}

fn read_exact<R: Read>(r: &mut R, size: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..])?;
    Ok(buf)
}

/// Trait representing a type which can be serialized into binary
///
/// Returns the number of bytes encoded
pub trait Encodable {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for Qid {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let mut bytes = self.typ.encode(w)?;
        bytes += self.version.encode(w)?;
        bytes += self.path.encode(w)?;
        Ok(bytes)
    }
}

impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let stat_size: u16 = self.size();
        stat_size.encode(w)?;
        self.typ.encode(w)?;
        self.dev.encode(w)?;
        self.qid.encode(w)?;
        self.mode.encode(w)?;
        self.atime.encode(w)?;
        self.mtime.encode(w)?;
        self.length.encode(w)?;
        self.name.encode(w)?;
        self.uid.encode(w)?;
        self.gid.encode(w)?;
        self.muid.encode(w)?;
        Ok(stat_size as usize + 2)
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let size = self.data().len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(self.data())?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        for s in self {
            bytes += s.encode(w)?;
        }
        Ok(bytes)
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> io::Result<usize> {
        let mut buf: Vec<u8> = Vec::new();

        encode!(buf, &(self.typ as u8));
        encode!(buf, &self.tag);
        match self.body {
            Fcall::Tversion { ref msize, ref version } => { encode!(buf, msize, version); }
            Fcall::Rversion { ref msize, ref version } => { encode!(buf, msize, version); }
            Fcall::Tauth { ref afid, ref uname, ref aname } => { encode!(buf, afid, uname, aname); }
            Fcall::Rauth { ref aqid } => { encode!(buf, aqid); }
            Fcall::Rerror { ref ename } => { encode!(buf, ename); }
            Fcall::Tflush { ref oldtag } => { encode!(buf, oldtag); }
            Fcall::Rflush => {}
            Fcall::Tattach { ref fid, ref afid, ref uname, ref aname } => { encode!(buf, fid, afid, uname, aname); }
            Fcall::Rattach { ref qid } => { encode!(buf, qid); }
            Fcall::Twalk { ref fid, ref newfid, ref wnames } => { encode!(buf, fid, newfid, wnames); }
            Fcall::Rwalk { ref wqids } => { encode!(buf, wqids); }
            Fcall::Topen { ref fid, ref mode } => { encode!(buf, fid, mode); }
            Fcall::Ropen { ref qid, ref iounit } => { encode!(buf, qid, iounit); }
            Fcall::Tcreate { ref fid, ref name, ref perm, ref mode } => { encode!(buf, fid, name, perm, mode); }
            Fcall::Rcreate { ref qid, ref iounit } => { encode!(buf, qid, iounit); }
            Fcall::Tread { ref fid, ref offset, ref count } => { encode!(buf, fid, offset, count); }
            Fcall::Rread { ref data } => { encode!(buf, data); }
            Fcall::Twrite { ref fid, ref offset, ref data } => { encode!(buf, fid, offset, data); }
            Fcall::Rwrite { ref count } => { encode!(buf, count); }
            Fcall::Tclunk { ref fid } => { encode!(buf, fid); }
            Fcall::Rclunk => {}
            Fcall::Tremove { ref fid } => { encode!(buf, fid); }
            Fcall::Rremove => {}
            Fcall::Tstat { ref fid } => { encode!(buf, fid); }
            Fcall::Rstat { ref stat } => {
                encode!(buf, &(stat.size() + 2));
                encode!(buf, stat);
            }
            Fcall::Twstat { ref fid, ref stat } => {
                encode!(buf, fid);
                encode!(buf, &(stat.size() + 2));
                encode!(buf, stat);
            }
            Fcall::Rwstat => {}
        };

        let size = mem::size_of::<u32>() + buf.len();
        w.write_u32::<LittleEndian>(size as u32)?;
        w.write_all(&buf)?;
        Ok(size)
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let buf = read_exact(r, len as usize)?;
        String::from_utf8(buf).or_else(|_| io_error!(InvalidData, "Invalid UTF-8 sequence"))
    }
}

impl Decodable for Qid {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        Ok(Qid {
            typ: Decodable::decode(r)?,
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        let _size: u16 = Decodable::decode(r)?;
        Ok(Stat {
            typ: Decodable::decode(r)?,
            dev: Decodable::decode(r)?,
            qid: Decodable::decode(r)?,
            mode: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            muid: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        let buf = read_exact(r, len as usize)?;
        Ok(Data::new(buf))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> io::Result<Self> {
        let size = r.read_u32::<LittleEndian>()?;
        if size < 4 {
            return io_error!(InvalidData, "Invalid message length");
        }
        let mut buf = Cursor::new(read_exact(r, size as usize - 4)?);

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            Some(MsgType::Tversion) => Fcall::Tversion { msize: decode!(buf), version: decode!(buf) },
            Some(MsgType::Rversion) => Fcall::Rversion { msize: decode!(buf), version: decode!(buf) },
            Some(MsgType::Tauth) => Fcall::Tauth { afid: decode!(buf), uname: decode!(buf), aname: decode!(buf) },
            Some(MsgType::Rauth) => Fcall::Rauth { aqid: decode!(buf) },
            Some(MsgType::Rerror) => Fcall::Rerror { ename: decode!(buf) },
            Some(MsgType::Tflush) => Fcall::Tflush { oldtag: decode!(buf) },
            Some(MsgType::Rflush) => Fcall::Rflush,
            Some(MsgType::Tattach) => Fcall::Tattach { fid: decode!(buf), afid: decode!(buf), uname: decode!(buf), aname: decode!(buf) },
            Some(MsgType::Rattach) => Fcall::Rattach { qid: decode!(buf) },
            Some(MsgType::Twalk) => Fcall::Twalk { fid: decode!(buf), newfid: decode!(buf), wnames: decode!(buf) },
            Some(MsgType::Rwalk) => Fcall::Rwalk { wqids: decode!(buf) },
            Some(MsgType::Topen) => Fcall::Topen { fid: decode!(buf), mode: decode!(buf) },
            Some(MsgType::Ropen) => Fcall::Ropen { qid: decode!(buf), iounit: decode!(buf) },
            Some(MsgType::Tcreate) => Fcall::Tcreate { fid: decode!(buf), name: decode!(buf), perm: decode!(buf), mode: decode!(buf) },
            Some(MsgType::Rcreate) => Fcall::Rcreate { qid: decode!(buf), iounit: decode!(buf) },
            Some(MsgType::Tread) => Fcall::Tread { fid: decode!(buf), offset: decode!(buf), count: decode!(buf) },
            Some(MsgType::Rread) => Fcall::Rread { data: decode!(buf) },
            Some(MsgType::Twrite) => Fcall::Twrite { fid: decode!(buf), offset: decode!(buf), data: decode!(buf) },
            Some(MsgType::Rwrite) => Fcall::Rwrite { count: decode!(buf) },
            Some(MsgType::Tclunk) => Fcall::Tclunk { fid: decode!(buf) },
            Some(MsgType::Rclunk) => Fcall::Rclunk,
            Some(MsgType::Tremove) => Fcall::Tremove { fid: decode!(buf) },
            Some(MsgType::Rremove) => Fcall::Rremove,
            Some(MsgType::Tstat) => Fcall::Tstat { fid: decode!(buf) },
            Some(MsgType::Rstat) => {
                let _nstat: u16 = decode!(buf);
                Fcall::Rstat { stat: decode!(buf) }
            }
            Some(MsgType::Twstat) => {
                let fid = decode!(buf);
                let _nstat: u16 = decode!(buf);
                Fcall::Twstat { fid, stat: decode!(buf) }
            }
            Some(MsgType::Rwstat) => Fcall::Rwstat,
            Some(MsgType::Terror) | None => return io_error!(InvalidData, "Invalid message type"),
        };

        Ok(Msg {
            typ: msg_type.unwrap(),
            tag,
            body,
        })
    }
}

/// Helper function to read a 9P message from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> io::Result<Msg> {
    Decodable::decode(r)
}

/// Helper function to write a 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> io::Result<usize> {
    msg.encode(w)
}
