//! 交互式控制台
//!
//! 从标准输入读取命令，把对等端事件打印到标准输出，接收完成的文件写入下载目录。

use anyhow::{Context, Result};
use qrsend_core::peer::{PeerEvent, PeerHandle, PeerSnapshot};
use qrsend_core::transfer::{format_bytes, format_eta};
use qrsend_core::{Artifact, ConnectionState, Direction, FileSource, TransferId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

const HELP: &str = "\
命令:
  send <路径>     发送文件
  cancel <id>     取消发送或接收
  chat <文本>     发送聊天消息
  host            连接失败后切换为主机
  list            查看传输列表
  quit            退出";

/// 控制台命令
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Send(PathBuf),
    Cancel(String),
    Chat(String),
    Host,
    List,
    Help,
    Quit,
}

impl Input {
    fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };
        let input = match (command, rest) {
            ("send", "") | ("cancel", "") | ("chat", "") => {
                return Err(format!("用法: {command} <参数>"));
            }
            ("send", path) => Input::Send(PathBuf::from(path)),
            ("cancel", id) => Input::Cancel(id.to_string()),
            ("chat", text) => Input::Chat(text.to_string()),
            ("host", _) => Input::Host,
            ("list" | "ls", _) => Input::List,
            ("help" | "?", _) => Input::Help,
            ("quit" | "exit", _) => Input::Quit,
            (other, _) => return Err(format!("未知命令: {other} (输入 help 查看帮助)")),
        };
        Ok(Some(input))
    }
}

/// 运行控制台直到用户退出或对等端停止
pub async fn run(
    handle: PeerHandle,
    mut events: UnboundedReceiver<PeerEvent>,
    download_dir: PathBuf,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printer = Printer::new(download_dir);
    println!("{HELP}");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match Input::parse(&line) {
                    Ok(Some(Input::Quit)) => break,
                    Ok(Some(input)) => execute(&handle, input).await?,
                    Ok(None) => {}
                    Err(message) => println!("{message}"),
                }
            }
            event = events.recv() => match event {
                Some(event) => printer.print(event).await,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let _ = handle.shutdown();
    println!("👋 再见");
    Ok(())
}

async fn execute(handle: &PeerHandle, input: Input) -> Result<()> {
    match input {
        Input::Send(path) => match FileSource::from_path(&path).await {
            Ok(source) => handle.send_file(source)?,
            Err(e) => println!("❌ 无法读取 {}: {e}", path.display()),
        },
        Input::Cancel(id) => {
            let snapshot = handle.snapshot().await?;
            let id = TransferId::from(id);
            match direction_of(&snapshot, &id) {
                Some(Direction::Outbound) => handle.cancel_send(id)?,
                Some(Direction::Inbound) => handle.cancel_receive(id)?,
                None => println!("未找到传输 {id}"),
            }
        }
        Input::Chat(text) => {
            handle.chat(text)?;
        }
        Input::Host => handle.become_host()?,
        Input::List => print_snapshot(&handle.snapshot().await?),
        Input::Help => println!("{HELP}"),
        Input::Quit => {}
    }
    Ok(())
}

fn direction_of(snapshot: &PeerSnapshot, id: &TransferId) -> Option<Direction> {
    if snapshot.outbound.iter().any(|job| &job.id == id) {
        Some(Direction::Outbound)
    } else if snapshot.inbound.iter().any(|transfer| &transfer.id == id) {
        Some(Direction::Inbound)
    } else {
        None
    }
}

fn print_snapshot(snapshot: &PeerSnapshot) {
    println!("状态: {:?} / {}", snapshot.role, snapshot.state);
    if let Some(descriptor) = &snapshot.descriptor {
        println!("链接: {descriptor}");
    }
    if snapshot.outbound.is_empty() && snapshot.inbound.is_empty() {
        println!("   没有进行中的传输");
    }
    for job in &snapshot.outbound {
        println!(
            "   📤 {} {} {}/{} ({:?})",
            job.id,
            job.name,
            format_bytes(job.sent),
            format_bytes(job.size),
            job.status
        );
    }
    for transfer in &snapshot.inbound {
        println!(
            "   📥 {} {} {}/{}",
            transfer.id,
            transfer.name,
            format_bytes(transfer.received),
            format_bytes(transfer.size)
        );
    }
}

/// 事件打印，进度按 10% 节流
struct Printer {
    download_dir: PathBuf,
    last_percent: HashMap<TransferId, u32>,
    names: HashMap<TransferId, String>,
}

impl Printer {
    fn new(download_dir: PathBuf) -> Self {
        Self {
            download_dir,
            last_percent: HashMap::new(),
            names: HashMap::new(),
        }
    }

    fn name<'a>(&'a self, id: &'a TransferId) -> &'a str {
        self.names.get(id).map_or(id.as_str(), String::as_str)
    }

    async fn print(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Status(status) => println!("ℹ️  {status}"),
            PeerEvent::State(ConnectionState::Connected) => println!("🔗 已连接"),
            PeerEvent::State(state) => tracing::debug!("Connection state: {state}"),
            PeerEvent::Descriptor(descriptor) => {
                println!("📡 分享链接 (在另一台设备上运行 qrsend start <链接>):");
                println!("   {descriptor}");
            }
            PeerEvent::HostFallback => {
                println!("⚠️  无法连接对方，输入 host 切换为主机模式");
            }
            PeerEvent::PeerReady(name) => {
                println!("🤝 对方已就绪: {}", name.as_deref().unwrap_or("未命名设备"));
            }
            PeerEvent::Queued { id, name, size } => {
                println!("📤 排队: {name} ({}) [{id}]", format_bytes(size));
                self.names.insert(id, name);
            }
            PeerEvent::Incoming { id, name, size } => {
                println!("📥 接收: {name} ({}) [{id}]", format_bytes(size));
                self.names.insert(id, name);
            }
            PeerEvent::Progress {
                direction,
                id,
                progress,
            } => {
                let step = progress.percent / 10;
                if self.last_percent.insert(id.clone(), step) != Some(step) {
                    let arrow = match direction {
                        Direction::Outbound => "⬆️",
                        Direction::Inbound => "⬇️",
                    };
                    println!(
                        "{arrow}  {} {}% ({}/{}, 剩余 {})",
                        self.name(&id),
                        progress.percent,
                        format_bytes(progress.transferred),
                        format_bytes(progress.total),
                        format_eta(progress.eta)
                    );
                }
            }
            PeerEvent::Sent(id) => {
                println!("✅ 已发送 {}", self.name(&id));
                self.forget(&id);
            }
            PeerEvent::Completed(artifact) => {
                let id = artifact.id.clone();
                match save_artifact(&self.download_dir, &artifact).await {
                    Ok(path) => println!("✅ 已保存 {}", path.display()),
                    Err(e) => println!("❌ 保存 {} 失败: {e:#}", artifact.name),
                }
                self.forget(&id);
            }
            PeerEvent::Cancelled { direction, id } => {
                let verb = match direction {
                    Direction::Outbound => "发送",
                    Direction::Inbound => "接收",
                };
                println!("⏹️  已取消{verb} {}", self.name(&id));
                self.forget(&id);
            }
            PeerEvent::Failed { id, reason } => {
                println!("❌ 发送 {} 失败: {reason}", self.name(&id));
                self.forget(&id);
            }
            PeerEvent::Chat { text, .. } => println!("💬 {text}"),
            PeerEvent::ChatRead(msg_id) => tracing::debug!("Chat {msg_id} read"),
        }
    }

    fn forget(&mut self, id: &TransferId) {
        self.last_percent.remove(id);
        self.names.remove(id);
    }
}

/// 写入下载目录，同名文件已存在时追加序号
async fn save_artifact(dir: &Path, artifact: &Artifact) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("无法创建目录 {}", dir.display()))?;
    let path = unique_path(dir, &sanitize_name(&artifact.name));
    tokio::fs::write(&path, &artifact.data)
        .await
        .with_context(|| format!("无法写入 {}", path.display()))?;
    Ok(path)
}

/// 只保留文件名部分，防止对端写到下载目录之外
fn sanitize_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        "received.bin".to_string()
    } else {
        base.to_string()
    }
}

fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map_or_else(|| name.to_string(), |s| s.to_string_lossy().to_string());
    let extension = path.extension().map(|e| e.to_string_lossy().to_string());

    (1..)
        .map(|n| match &extension {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Input::parse("send ./a b.txt"),
            Ok(Some(Input::Send(PathBuf::from("./a b.txt"))))
        );
        assert_eq!(
            Input::parse("chat  hello world "),
            Ok(Some(Input::Chat("hello world".to_string())))
        );
        assert_eq!(Input::parse("ls"), Ok(Some(Input::List)));
        assert_eq!(Input::parse("   "), Ok(None));
        assert!(Input::parse("send").is_err());
        assert!(Input::parse("dance").is_err());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_name("C:\\Users\\x\\photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_name(".."), "received.bin");
        assert_eq!(sanitize_name(""), "received.bin");
    }

    #[test]
    fn test_unique_path() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_path(dir.path(), "a.txt"), dir.path().join("a.txt"));

        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        assert_eq!(
            unique_path(dir.path(), "a.txt"),
            dir.path().join("a (1).txt")
        );

        std::fs::write(dir.path().join("a (1).txt"), b"x").unwrap();
        assert_eq!(
            unique_path(dir.path(), "a.txt"),
            dir.path().join("a (2).txt")
        );
    }

    #[tokio::test]
    async fn test_save_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = Artifact {
            id: TransferId::from("t1"),
            name: "notes.txt".to_string(),
            media_type: "text/plain".to_string(),
            data: b"hello".to_vec(),
        };

        let first = save_artifact(dir.path(), &artifact).await.unwrap();
        let second = save_artifact(dir.path(), &artifact).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"hello");
        assert_eq!(std::fs::read(&second).unwrap(), b"hello");
    }
}
