//! Messaging transport.
//!
//! Messages are serde values in length-delimited bincode frames: a `u32`
//! little-endian payload length, then the payload. Frames are written with
//! a single `write_all` per part and read with `read_exact`, so a message
//! is never partially delivered; per pipe, order is preserved. bincode is
//! not self-describing, which is the point: if the two ends disagree on a
//! tag's field sequence, decoding fails and the run dies loudly instead of
//! silently misreading fields.
//!
//! The master side talks to the pool through the [`Cluster`] trait. The
//! production implementation spawns one `muster-worker` process per core
//! and fans every worker's replies into a single channel, which is what
//! makes `recv_result` a receive-from-anyone in arrival order. Placing the
//! worker process on its named host is the cluster daemon's business, not
//! ours; the hostname still travels with the spawn for the node map and
//! the daemon's benefit.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use crate::error::MusterError;
use crate::message::{Greeting, TaskResult, Work, WorkerId};

/// Name of the worker executable, expected next to the master binary.
pub const WORKER_EXE: &str = "muster-worker";

/// Upper bound on a frame payload; anything larger is a corrupt or foreign
/// stream.
const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Writes one framed message and flushes, so a pipe reader sees it now.
pub fn write_frame<T: Serialize, W: Write>(writer: &mut W, msg: &T) -> io::Result<()> {
    let payload = bincode::serialize(msg).map_err(encode_err)?;
    let len = u32::try_from(payload.len()).map_err(|_| oversized(payload.len()))?;
    if len > MAX_FRAME {
        return Err(oversized(payload.len()));
    }
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()
}

/// Reads one framed message. `Ok(None)` means the peer closed the stream
/// at a frame boundary.
pub fn read_frame<T: DeserializeOwned, R: Read>(reader: &mut R) -> io::Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME {
        return Err(oversized(len as usize));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    bincode::deserialize(&payload).map(Some).map_err(encode_err)
}

/// Async twin of [`write_frame`]; the encodings are identical.
pub async fn write_frame_async<T, W>(writer: &mut W, msg: &T) -> io::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let payload = bincode::serialize(msg).map_err(encode_err)?;
    let len = u32::try_from(payload.len()).map_err(|_| oversized(payload.len()))?;
    if len > MAX_FRAME {
        return Err(oversized(payload.len()));
    }
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

/// Async twin of [`read_frame`].
pub async fn read_frame_async<T, R>(reader: &mut R) -> io::Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME {
        return Err(oversized(len as usize));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    bincode::deserialize(&payload).map(Some).map_err(encode_err)
}

fn encode_err(e: bincode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

fn oversized(len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame of {} bytes exceeds the {} byte limit", len, MAX_FRAME),
    )
}

/// Master's view of the worker pool.
///
/// `spawn_worker` assigns dense ids in spawn order; `recv_result` blocks
/// for a reply from any worker, in arrival order. Implementations must
/// deliver messages reliably and in order per worker.
#[async_trait]
pub trait Cluster: Send {
    async fn spawn_worker(&mut self, host: &str) -> Result<WorkerId, MusterError>;
    async fn greet(&mut self, id: WorkerId, greeting: &Greeting) -> Result<(), MusterError>;
    async fn send(&mut self, id: WorkerId, work: &Work) -> Result<(), MusterError>;
    async fn recv_result(&mut self) -> Result<TaskResult, MusterError>;
    /// Tears the pool down: close every link, then wait for the workers.
    async fn halt(&mut self) -> Result<(), MusterError>;
}

struct ProcWorker {
    child: Child,
    stdin: Option<ChildStdin>,
}

/// Process-backed cluster: one `muster-worker` child per worker, framed
/// protocol on its stdin/stdout, stderr captured into `outfile.txt`.
pub struct ProcessCluster {
    worker_exe: PathBuf,
    outfile: Arc<Mutex<File>>,
    results_tx: flume::Sender<Result<TaskResult, String>>,
    results_rx: flume::Receiver<Result<TaskResult, String>>,
    workers: Vec<ProcWorker>,
    io_tasks: Vec<JoinHandle<()>>,
}

impl ProcessCluster {
    /// Creates the cluster with the worker executable expected next to the
    /// running master binary.
    pub fn new(out_dir: &Path) -> Result<Self, MusterError> {
        let exe = std::env::current_exe()
            .map_err(|e| MusterError::ClusterInit(format!("cannot locate own binary: {e}")))?;
        let worker_exe = exe
            .parent()
            .ok_or_else(|| MusterError::ClusterInit("own binary has no parent dir".into()))?
            .join(WORKER_EXE);
        Self::with_worker_exe(out_dir, worker_exe)
    }

    /// Same, with an explicit worker executable (tests use the cargo-built
    /// binary path).
    pub fn with_worker_exe(out_dir: &Path, worker_exe: PathBuf) -> Result<Self, MusterError> {
        let outfile_path = out_dir.join("outfile.txt");
        let outfile = File::create(&outfile_path).map_err(|source| MusterError::OutfileOpen {
            path: outfile_path,
            source,
        })?;
        let (results_tx, results_rx) = flume::unbounded();
        Ok(Self {
            worker_exe,
            outfile: Arc::new(Mutex::new(outfile)),
            results_tx,
            results_rx,
            workers: Vec::new(),
            io_tasks: Vec::new(),
        })
    }
}

#[async_trait]
impl Cluster for ProcessCluster {
    async fn spawn_worker(&mut self, host: &str) -> Result<WorkerId, MusterError> {
        let mut child = Command::new(&self.worker_exe)
            .arg(host)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MusterError::Spawn {
                host: host.to_string(),
                source,
            })?;
        let id = self.workers.len();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Reply pump: every worker's results land in the same channel,
        // which is what recv_result drains.
        if let Some(mut stdout) = stdout {
            let tx = self.results_tx.clone();
            self.io_tasks.push(tokio::spawn(async move {
                loop {
                    match read_frame_async::<TaskResult, _>(&mut stdout).await {
                        Ok(Some(result)) => {
                            if tx.send_async(Ok(result)).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx
                                .send_async(Err(format!("worker {id} reply stream: {e}")))
                                .await;
                            break;
                        }
                    }
                }
            }));
        }

        // Everything a worker prints on stderr is part of the run record.
        if let Some(stderr) = stderr {
            let outfile = Arc::clone(&self.outfile);
            self.io_tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Ok(mut file) = outfile.lock() {
                        let _ = writeln!(file, "[w{:02}] {}", id, line);
                    }
                }
            }));
        }

        self.workers.push(ProcWorker { child, stdin });
        Ok(id)
    }

    async fn greet(&mut self, id: WorkerId, greeting: &Greeting) -> Result<(), MusterError> {
        self.write_to(id, greeting).await
    }

    async fn send(&mut self, id: WorkerId, work: &Work) -> Result<(), MusterError> {
        self.write_to(id, work).await
    }

    async fn recv_result(&mut self) -> Result<TaskResult, MusterError> {
        match self.results_rx.recv_async().await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(msg)) => Err(MusterError::Protocol(msg)),
            Err(_) => Err(MusterError::Protocol("all reply streams closed".into())),
        }
    }

    async fn halt(&mut self) -> Result<(), MusterError> {
        // Closing stdin is the quiesce signal for any worker that has not
        // seen an explicit STOP.
        for worker in &mut self.workers {
            worker.stdin.take();
        }
        for worker in &mut self.workers {
            let _ = worker.child.wait().await;
        }
        join_all(self.io_tasks.drain(..)).await;
        Ok(())
    }
}

impl ProcessCluster {
    async fn write_to<T: Serialize + Sync>(
        &mut self,
        id: WorkerId,
        msg: &T,
    ) -> Result<(), MusterError> {
        let worker = self
            .workers
            .get_mut(id)
            .ok_or_else(|| MusterError::Protocol(format!("unknown worker id {id}")))?;
        let stdin = worker
            .stdin
            .as_mut()
            .ok_or_else(|| MusterError::Protocol(format!("worker {id} link is closed")))?;
        write_frame_async(stdin, msg)
            .await
            .map_err(|e| MusterError::Protocol(format!("send to worker {id}: {e}")))
    }
}

/// Operator escape hatch (`--kill`): SIGKILL every stray worker process on
/// this host. Workers on other nodes are the daemon's to clean up.
pub fn kill_stray_workers() -> io::Result<usize> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let mut killed = 0;
    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        let name = entry.file_name();
        let pid: i32 = match name.to_string_lossy().parse() {
            Ok(pid) => pid,
            Err(_) => continue,
        };
        let comm = match fs::read_to_string(entry.path().join("comm")) {
            Ok(comm) => comm,
            Err(_) => continue,
        };
        if comm.trim_end() == WORKER_EXE && kill(Pid::from_raw(pid), Signal::SIGKILL).is_ok() {
            killed += 1;
        }
    }
    Ok(killed)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::PathBuf;

    use crate::message::Status;

    use super::*;

    #[test]
    fn sync_round_trip() {
        let msg = Work::Task {
            task_number: 42,
            program: PathBuf::from("prog"),
            out_dir: PathBuf::from("/tmp/out"),
            args_csv: "a,b,c".to_string(),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &msg).unwrap();
        write_frame(&mut buf, &Work::Stop).unwrap();

        let mut cursor = Cursor::new(buf);
        let first: Work = read_frame(&mut cursor).unwrap().unwrap();
        match first {
            Work::Task { task_number, args_csv, .. } => {
                assert_eq!(task_number, 42);
                assert_eq!(args_csv, "a,b,c");
            }
            Work::Stop => panic!("expected a task"),
        }
        assert!(matches!(read_frame::<Work, _>(&mut cursor).unwrap(), Some(Work::Stop)));
        assert!(read_frame::<Work, _>(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME + 1).to_le_bytes());
        let err = read_frame::<Work, _>(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn sync_written_frames_decode_async() {
        let result = TaskResult {
            worker_id: 3,
            task_number: 7,
            status: Status::Ok,
            args_csv: "x,y".to_string(),
            exec_seconds: Some(1.25),
            total_seconds: 2.5,
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &result).unwrap();

        let mut reader = &buf[..];
        let decoded: TaskResult = read_frame_async(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded.worker_id, 3);
        assert_eq!(decoded.task_number, 7);
        assert_eq!(decoded.status, Status::Ok);
        assert_eq!(decoded.args_csv, "x,y");
        assert_eq!(decoded.exec_seconds, Some(1.25));
        assert!(read_frame_async::<TaskResult, _>(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn async_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let greeting = Greeting {
            worker_id: 1,
            task_type: crate::task::TaskType::C,
            max_task_kib: 0,
            create_err: true,
            create_mem: false,
            program_override: None,
        };
        write_frame_async(&mut a, &greeting).await.unwrap();
        drop(a);
        let decoded: Greeting = read_frame_async(&mut b).await.unwrap().unwrap();
        assert_eq!(decoded.worker_id, 1);
        assert!(decoded.create_err);
        assert!(read_frame_async::<Greeting, _>(&mut b).await.unwrap().is_none());
    }

    #[test]
    fn mismatched_type_is_invalid_data() {
        // A Greeting frame read as a TaskResult must fail loudly.
        let greeting = Greeting {
            worker_id: 0,
            task_type: crate::task::TaskType::Maple,
            max_task_kib: 0,
            create_err: false,
            create_mem: false,
            program_override: None,
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &greeting).unwrap();
        let res = read_frame::<TaskResult, _>(&mut Cursor::new(buf));
        assert!(res.is_err() || res.unwrap().is_none());
    }
}
