use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    fs::OpenOptions,
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::TcpStream,
    select,
    time::{self, Instant, Interval},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    console::{ConsoleCommand, HELP},
    protocol::{ClientEnvelope, ClientId, encode},
    session::{ReceivedFile, RoutingMode, Session, SessionEvent, placeholder_name},
};

type HubStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type HubSink = SplitSink<HubStream, Message>;
type HubSource = SplitStream<HubStream>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut session = Session::new();
    let (sink, mut source) = establish_connection(&args, &mut session).await?;
    let mut client = ClientState {
        session,
        sink,
        download_dir: args.download_dir.clone(),
    };

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let period = Duration::from_secs(args.keepalive_secs);
    let mut keepalive = time::interval_at(Instant::now() + period, period);

    let result = run_client_loop(
        &mut client,
        &mut source,
        &mut stdin,
        &mut keepalive,
    )
    .await;

    client.session.mark_disconnected();
    shutdown_connection(&mut client.sink).await;
    result
}

async fn establish_connection(
    args: &ClientArgs,
    session: &mut Session,
) -> Result<(HubSink, HubSource)> {
    session.begin_connect();
    let stream = match connect_async(args.server.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(err) => {
            session.mark_disconnected();
            return Err(err).with_context(|| format!("failed to connect to {}", args.server));
        }
    };
    session.mark_connected();

    info!("connected to {}", args.server);
    Ok(stream.split())
}

/// `next_line` is cancel safe, so a line typed while another branch wins is
/// kept for the next pass.
async fn run_client_loop<R>(
    client: &mut ClientState,
    source: &mut HubSource,
    stdin: &mut Lines<R>,
    keepalive: &mut Interval,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        select! {
            server_message = source.next() => {
                if !client.handle_server_message(server_message).await? {
                    break;
                }
            }
            line = stdin.next_line() => {
                if !client.handle_stdin_input(line).await? {
                    break;
                }
            }
            _ = keepalive.tick() => {
                client.send_keepalive().await?;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

struct ClientState {
    session: Session,
    sink: HubSink,
    download_dir: PathBuf,
}

impl ClientState {
    async fn handle_server_message(
        &mut self,
        message: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> Result<bool> {
        match message {
            Some(Ok(Message::Text(text))) => {
                match self.session.on_text_frame(&text) {
                    Ok(event) => render_event(event).await?,
                    Err(err) => write_stderr(&format!("!!! {err}")).await?,
                }
                Ok(true)
            }
            Some(Ok(Message::Binary(bytes))) => {
                let file = self.session.on_binary_frame(bytes);
                match store_received(&self.download_dir, &file).await {
                    Ok(line) => write_stdout(&line).await?,
                    Err(err) => write_stderr(&format!("!!! could not save file: {err:#}")).await?,
                }
                Ok(true)
            }
            Some(Ok(Message::Close(_))) | None => {
                write_stdout("*** server closed the connection").await?;
                Ok(false)
            }
            Some(Ok(_)) => Ok(true),
            Some(Err(err)) => {
                write_stderr(&format!("!!! connection error: {err}")).await?;
                Ok(false)
            }
        }
    }

    async fn handle_stdin_input(&mut self, line: io::Result<Option<String>>) -> Result<bool> {
        let Some(input) = line? else {
            return Ok(false);
        };

        let command = match ConsoleCommand::parse(&input) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(true),
            Err(err) => {
                write_stderr(&format!("!!! {err}")).await?;
                return Ok(true);
            }
        };

        match command {
            ConsoleCommand::Quit => {
                write_stdout("*** leaving relay").await?;
                return Ok(false);
            }
            ConsoleCommand::Help => write_stdout(HELP).await?,
            ConsoleCommand::Who => write_stdout(&membership_line(&self.session.others())).await?,
            ConsoleCommand::Mode(mode) => {
                self.session.set_mode(mode);
                let label = match mode {
                    RoutingMode::Broadcast => "broadcast",
                    RoutingMode::Private => "private",
                };
                write_stdout(&format!("*** mode: {label}")).await?;
            }
            ConsoleCommand::Select(id) => match self.session.select_target(id) {
                Ok(()) => write_stdout(&format!("*** selected client {id}")).await?,
                Err(err) => write_stderr(&format!("!!! {err}")).await?,
            },
            ConsoleCommand::Message(text) => self.send_text(&text).await?,
            ConsoleCommand::SendFile(path) => self.send_file(&path).await?,
        }
        Ok(true)
    }

    async fn send_text(&mut self, text: &str) -> Result<()> {
        let request = match self.session.text_request(text) {
            Ok(request) => request,
            Err(err) => return write_stderr(&format!("!!! {err}")).await.map_err(Into::into),
        };
        self.send_envelope(&request).await?;
        write_stdout(&format!("{} you: {}", self.echo_prefix(), text.trim())).await?;
        Ok(())
    }

    /// `file_info` first, then the bytes as one binary frame.
    async fn send_file(&mut self, path: &Path) -> Result<()> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                return write_stderr(&format!("!!! cannot read {}: {err}", path.display()))
                    .await
                    .map_err(Into::into);
            }
        };
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(placeholder_name);

        let request = match self.session.file_request(&filename, bytes.len() as u64) {
            Ok(request) => request,
            Err(err) => return write_stderr(&format!("!!! {err}")).await.map_err(Into::into),
        };
        self.send_envelope(&request).await?;
        self.sink
            .send(Message::Binary(bytes))
            .await
            .context("failed to send file bytes to hub")?;

        write_stdout(&format!("{} sent file: {filename}", self.echo_prefix())).await?;
        Ok(())
    }

    async fn send_keepalive(&mut self) -> Result<()> {
        if let Some(ping) = self.session.keepalive() {
            self.send_envelope(&ping).await?;
        }
        Ok(())
    }

    async fn send_envelope(&mut self, envelope: &ClientEnvelope) -> Result<()> {
        let text = encode(envelope)?;
        self.sink
            .send(Message::Text(text))
            .await
            .context("failed to send envelope to hub")
    }

    fn echo_prefix(&self) -> String {
        match (self.session.mode(), self.session.selected_target()) {
            (RoutingMode::Private, Some(target)) => format!("[PRIVATE to client {target}]"),
            _ => "[BROADCAST]".to_string(),
        }
    }
}

const MAX_NAME_ATTEMPTS: usize = 1000;

/// Saves a received file and returns the line announcing it.
pub async fn store_received(dir: &Path, file: &ReceivedFile) -> Result<String> {
    let path = save_received_file(dir, file).await?;
    let size = file.bytes.len();
    Ok(match file.from {
        Some(from) => format!(
            "*** received file: {} from client {from} ({size} bytes) -> {}",
            file.filename,
            path.display()
        ),
        None => format!("*** received file ({size} bytes) -> {}", path.display()),
    })
}

/// Writes a received file under `dir`, keeping only the last path component
/// of the announced name. Existing entries are never overwritten; a taken
/// name gets a ` (n)` suffix before its extension.
pub async fn save_received_file(dir: &Path, file: &ReceivedFile) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let name = safe_file_name(&file.filename);

    let mut attempt = 0;
    loop {
        let path = dir.join(numbered_name(&name, attempt));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut out) => {
                out.write_all(&file.bytes)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?;
                out.flush()
                    .await
                    .with_context(|| format!("failed to flush {}", path.display()))?;
                return Ok(path);
            }
            Err(err)
                if err.kind() == io::ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS =>
            {
                attempt += 1;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to create {}", path.display()));
            }
        }
    }
}

fn numbered_name(name: &str, attempt: usize) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    let path = Path::new(name);
    match (
        path.file_stem().and_then(|stem| stem.to_str()),
        path.extension().and_then(|ext| ext.to_str()),
    ) {
        (Some(stem), Some(ext)) => format!("{stem} ({attempt}).{ext}"),
        _ => format!("{name} ({attempt})"),
    }
}

pub fn safe_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(placeholder_name)
}

fn membership_line(others: &[ClientId]) -> String {
    if others.is_empty() {
        return "*** no other clients".to_string();
    }
    let ids: Vec<String> = others.iter().map(ToString::to_string).collect();
    format!("*** online: you + {} others ({})", others.len(), ids.join(", "))
}

async fn render_event(event: SessionEvent) -> io::Result<()> {
    match event {
        SessionEvent::Welcome { client_id } => {
            write_stdout(&format!("*** connected as client {client_id}")).await
        }
        SessionEvent::Text {
            from,
            message,
            is_private,
        } => {
            let prefix = if is_private { "[PRIVATE]" } else { "[PUBLIC]" };
            write_stdout(&format!("{prefix} client {from}: {message}")).await
        }
        SessionEvent::FileAnnounced {
            from,
            filename,
            size,
            is_private,
        } => {
            let prefix = if is_private {
                "[PRIVATE FILE]"
            } else {
                "[PUBLIC FILE]"
            };
            write_stdout(&format!(
                "{prefix} client {from} will send: {filename} ({size} bytes)"
            ))
            .await
        }
        SessionEvent::Membership { others } => write_stdout(&membership_line(&others)).await,
        SessionEvent::Pong => Ok(()),
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(sink: &mut HubSink) {
    if let Err(error) = sink.close().await {
        warn!(?error, "failed to close hub connection cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announced_names_cannot_escape_download_dir() {
        assert_eq!(safe_file_name("report.pdf"), "report.pdf");
        assert_eq!(safe_file_name("../../etc/passwd"), "passwd");
        assert_eq!(safe_file_name("/tmp/x.bin"), "x.bin");
        assert!(safe_file_name("..").starts_with("file_"));
        assert!(safe_file_name("").starts_with("file_"));
    }

    #[test]
    fn membership_line_counts_others() {
        assert_eq!(membership_line(&[]), "*** no other clients");
        assert_eq!(membership_line(&[1, 3]), "*** online: you + 2 others (1, 3)");
    }

    #[tokio::test]
    async fn received_file_is_written_under_download_dir() {
        let dir = tempfile::tempdir().expect("temp dir");
        let file = ReceivedFile {
            filename: "../notes.txt".into(),
            from: Some(1),
            bytes: b"hello".to_vec(),
        };

        let path = save_received_file(&dir.path().join("inbox"), &file)
            .await
            .expect("save file");

        assert_eq!(path, dir.path().join("inbox").join("notes.txt"));
        assert_eq!(tokio::fs::read(&path).await.expect("read back"), b"hello");
    }

    #[tokio::test]
    async fn partial_console_line_survives_a_competing_branch() {
        let (mut typist, console) = tokio::io::duplex(64);
        let mut lines = BufReader::new(console).lines();

        typist.write_all(b"/sel").await.expect("write prefix");
        let mut ticks = time::interval(Duration::from_millis(5));
        ticks.tick().await;
        select! {
            line = lines.next_line() => panic!("line is not complete yet: {line:?}"),
            _ = ticks.tick() => {}
        }

        typist.write_all(b"ect 2\n").await.expect("write rest");
        let line = lines.next_line().await.expect("read line");
        assert_eq!(line.as_deref(), Some("/select 2"));
    }

    #[test]
    fn numbered_names_keep_the_extension() {
        assert_eq!(numbered_name("notes.txt", 0), "notes.txt");
        assert_eq!(numbered_name("notes.txt", 2), "notes (2).txt");
        assert_eq!(numbered_name("README", 1), "README (1)");
    }

    #[tokio::test]
    async fn same_name_downloads_are_kept_side_by_side() {
        let dir = tempfile::tempdir().expect("temp dir");
        let first = ReceivedFile {
            filename: "notes.txt".into(),
            from: Some(1),
            bytes: b"from one".to_vec(),
        };
        let second = ReceivedFile {
            filename: "notes.txt".into(),
            from: Some(2),
            bytes: b"from two".to_vec(),
        };

        let first_path = save_received_file(dir.path(), &first).await.expect("first");
        let second_path = save_received_file(dir.path(), &second).await.expect("second");

        assert_eq!(first_path, dir.path().join("notes.txt"));
        assert_eq!(second_path, dir.path().join("notes (1).txt"));
        assert_eq!(tokio::fs::read(&first_path).await.expect("first"), b"from one");
        assert_eq!(tokio::fs::read(&second_path).await.expect("second"), b"from two");
    }

    #[tokio::test]
    async fn name_of_existing_directory_is_saved_alongside_it() {
        let dir = tempfile::tempdir().expect("temp dir");
        tokio::fs::create_dir(dir.path().join("photos"))
            .await
            .expect("make photos dir");
        let file = ReceivedFile {
            filename: "photos".into(),
            from: Some(3),
            bytes: b"jpeg".to_vec(),
        };

        let line = store_received(dir.path(), &file).await.expect("store");

        let saved = dir.path().join("photos (1)");
        assert_eq!(tokio::fs::read(&saved).await.expect("read back"), b"jpeg");
        assert!(line.starts_with("*** received file: photos from client 3 (4 bytes)"));
    }

    #[tokio::test]
    async fn unwritable_download_dir_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().expect("temp dir");
        let blocker = dir.path().join("inbox");
        tokio::fs::write(&blocker, b"not a directory")
            .await
            .expect("make blocker file");
        let file = ReceivedFile {
            filename: "a.txt".into(),
            from: None,
            bytes: vec![1],
        };

        assert!(store_received(&blocker, &file).await.is_err());
    }
}
