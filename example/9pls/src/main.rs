//! List files on a 9P server
//!
//! Dial a server, attach as the current user, walk to a path and print
//! what is there.

use rs9pmnt::serialize::Decodable;
use rs9pmnt::*;
use std::io::Cursor;
use std::sync::Arc;
use tokio::net::TcpStream;

// return: (proto, addr:port)
fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let mut split = arg.split('!');
    let proto = split.next()?;
    let addr = split.next()?;
    let port = split.next()?;
    Some((proto, format!("{}:{}", addr, port)))
}

fn usage(arg0: &str) -> ! {
    eprintln!("Usage: {} tcp!HOST!PORT [path]", arg0);
    std::process::exit(1)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        usage(&args[0]);
    }
    let (proto, sockaddr) = match parse_proto(&args[1]) {
        Some(pair) => pair,
        None => usage(&args[0]),
    };
    if proto != "tcp" {
        eprintln!("unsupported protocol: {}", proto);
        std::process::exit(1);
    }
    let path = args.get(2).map(String::as_str).unwrap_or("");

    let stream = TcpStream::connect(&sockaddr).await.map_err(Error::Io)?;
    let trans: Arc<dyn Transport> = Arc::new(StreamTransport::new(stream));

    let intr = Intr::new();
    let user = std::env::var("USER").unwrap_or_else(|_| "none".to_owned());
    let root = attach(&trans, None, &user, "", MntFlags::empty(), &intr).await?;

    let names: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let wq = root.walk(&names, &intr).await?;
    let mut dir = match wq.clone {
        Some(c) => c,
        None => {
            eprintln!("{}: walked only {} of {} elements", path, wq.qids.len(), names.len());
            std::process::exit(1);
        }
    };

    if dir.qid().typ & qt::DIR != 0 {
        dir.open(om::READ, &intr).await?;
        let mut buf = vec![0u8; dir.iounit() as usize];
        let mut off = 0u64;
        loop {
            let n = dir.read(&mut buf, off, &intr).await?;
            if n == 0 {
                break;
            }
            let mut cur = Cursor::new(&buf[..n]);
            while (cur.position() as usize) < n {
                let st = Stat::decode(&mut cur).map_err(Error::Io)?;
                println!("{:>11o} {:>10} {}", st.mode, st.length, st.name);
            }
            off += n as u64;
        }
    } else {
        let st = dir.dirstat(&intr).await?;
        println!("{:>11o} {:>10} {}", st.mode, st.length, st.name);
    }

    dir.clunk(&intr).await?;
    Ok(())
}
