//! Framed rpc between the coordinator and in-vm runners: length-prefixed
//! bincode messages over tcp. The single method both reports the previous
//! outcome and long-polls for the next program.

use crate::analyzer::Analyzer;
use crate::util::vm_key;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::Arc,
    thread,
};
use thiserror::Error;

/// Upper bound on one frame; a serialized program is tiny compared to this.
const MAX_FRAME: u32 = 16 << 20;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("frame too large: {0} bytes")]
    Oversized(u32),
    #[error("{0}")]
    Server(String),
}

/// Per-call execution info reported by the runner.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CallInfo {
    pub flags: u32,
    pub errno: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecInfo {
    pub calls: Vec<CallInfo>,
}

/// Request of the runner: the outcome of its previous program (`task_id`
/// empty on the first call) and an implicit ask for the next one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramArgs {
    pub pool: usize,
    pub vm: usize,
    pub task_id: String,
    pub info: Option<ExecInfo>,
    pub hanged: bool,
    pub error: Option<Vec<u8>>,
}

/// Reply: the next program to execute, in serialized form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramResults {
    pub id: String,
    pub prog: Vec<u8>,
}

pub fn send_msg<T: Serialize, W: Write>(w: &mut W, v: &T) -> Result<(), RpcError> {
    let body = bincode::serialize(v)?;
    w.write_all(&(body.len() as u32).to_le_bytes())?;
    w.write_all(&body)?;
    w.flush()?;
    Ok(())
}

pub fn recv_msg<T: DeserializeOwned, R: Read>(r: &mut R) -> Result<T, RpcError> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header)?;
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME {
        return Err(RpcError::Oversized(len));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)?;
    Ok(bincode::deserialize(&body)?)
}

/// One request/reply exchange, from the runner's side.
pub fn call(stream: &mut TcpStream, args: &ProgramArgs) -> Result<ProgramResults, RpcError> {
    send_msg(stream, args)?;
    let reply: Result<ProgramResults, String> = recv_msg(stream)?;
    reply.map_err(RpcError::Server)
}

/// Bind the rpc listener and serve runner connections on background
/// threads. Returns the bound port, which the supervisors forward into
/// every guest.
pub fn serve(analyzer: Arc<Analyzer>, addr: &str) -> Result<u16, RpcError> {
    let listener = TcpListener::bind(addr)?;
    let port = listener.local_addr()?.port();
    log::info!("rpc listening on port {}", port);

    thread::Builder::new()
        .name("rpc-accept".to_string())
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let analyzer = Arc::clone(&analyzer);
                        let _ = thread::Builder::new()
                            .name("rpc-conn".to_string())
                            .spawn(move || handle_conn(analyzer, stream));
                    }
                    Err(e) => log::warn!("rpc accept: {}", e),
                }
            }
        })
        .expect("failed to spawn rpc accept thread");

    Ok(port)
}

fn handle_conn(analyzer: Arc<Analyzer>, mut stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    log::debug!("runner connected from {}", peer);
    loop {
        let args: ProgramArgs = match recv_msg(&mut stream) {
            Ok(args) => args,
            Err(e) => {
                log::debug!("runner {} disconnected: {}", peer, e);
                return;
            }
        };
        analyzer.add_program_result(&args);
        let reply = analyzer
            .next_program(vm_key(args.pool, args.vm))
            .map(|(id, prog)| ProgramResults { id, prog })
            .map_err(|e| e.to_string());
        if let Err(e) = send_msg(&mut stream, &reply) {
            log::debug!("runner {} disconnected: {}", peer, e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip() {
        let args = ProgramArgs {
            pool: 1,
            vm: 2,
            task_id: "abc".to_string(),
            info: Some(ExecInfo {
                calls: vec![CallInfo { flags: 1, errno: 0 }],
            }),
            hanged: false,
            error: Some(b"BUG: foo".to_vec()),
        };
        let mut buf = Vec::new();
        send_msg(&mut buf, &args).unwrap();
        let decoded: ProgramArgs = recv_msg(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded.task_id, "abc");
        assert_eq!(decoded.error.as_deref(), Some(&b"BUG: foo"[..]));
        assert_eq!(decoded.info.unwrap().calls.len(), 1);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut buf = Vec::new();
        buf.extend((MAX_FRAME + 1).to_le_bytes());
        let err = recv_msg::<ProgramArgs, _>(&mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, RpcError::Oversized(_)));
    }

    #[test]
    fn end_to_end_poll_and_report() {
        use crate::stats::Statistics;
        use crate::util::prog_hash;
        use repro_core::parse::parse_log;
        use std::path::PathBuf;

        let stats = Arc::new(Statistics::new(1, None).unwrap());
        let analyzer = Arc::new(Analyzer::new(
            Vec::new(),
            PathBuf::from("repro-runner"),
            PathBuf::from("syz-executor"),
            stats,
        ));
        let prog = parse_log(b"close(0x3)\n").remove(0);
        analyzer.add_tasks_by_id(vm_key(0, 0), &[prog.clone()], 1);

        let port = serve(Arc::clone(&analyzer), "127.0.0.1:0").unwrap();
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();

        // first poll carries no outcome and fetches the program
        let first = call(
            &mut stream,
            &ProgramArgs {
                pool: 0,
                vm: 0,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(first.id, prog_hash(&prog));
        assert_eq!(first.prog, prog.serialize());

        // second poll reports a crash and gets the requeued run
        let report = ProgramArgs {
            pool: 0,
            vm: 0,
            task_id: first.id.clone(),
            error: Some(b"BUG: foo".to_vec()),
            ..Default::default()
        };
        let second = call(&mut stream, &report).unwrap();
        assert_eq!(second.id, first.id);

        let json: serde_json::Value =
            serde_json::from_str(&analyzer.stats().json().unwrap()).unwrap();
        assert_eq!(json["TotalRuns"], 1);
        assert_eq!(json["ErrorRuns"], 1);
        assert_eq!(json["Results"][&first.id]["ErrorRuns"], 1);
    }
}
