use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Arg, Command};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;

use swarmshare::{
    conf::{Conf, TrackerInfo},
    error::Error,
    peer::{DownloadOutcome, Reply, TrackerSession},
    peer_server::ChunkServer,
    registry::FileRegistry,
    wire::Request,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // set up cli args
    let matches = Command::new("peer")
        .about("Interactive peer for group based peer-to-peer file sharing")
        .arg(
            Arg::new("listen")
                .value_name("IP:PORT")
                .help("The address this peer's chunk server listens on")
                .required(true),
        )
        .arg(
            Arg::new("tracker-info")
                .value_name("TRACKER_INFO")
                .help("Path to the two-line `<ip> <port>` endpoint file")
                .required(true),
        )
        .get_matches();

    let listen_addr: SocketAddr =
        matches.get_one::<String>("listen").unwrap().parse()?;
    let info_path = matches.get_one::<String>("tracker-info").unwrap();

    // peers always use the first tracker endpoint
    let info = TrackerInfo::load(Path::new(info_path))?;
    let conf = Conf::new(listen_addr, info.primary);

    let shutdown = CancellationToken::new();
    let registry = Arc::new(FileRegistry::new());

    // the chunk server runs concurrently with the interactive loop; it
    // binds on all interfaces while the configured address is what gets
    // advertised to the tracker
    let bind_addr = SocketAddr::new(
        std::net::Ipv4Addr::UNSPECIFIED.into(),
        listen_addr.port(),
    );
    let server = ChunkServer::bind(
        bind_addr,
        Arc::clone(&registry),
        shutdown.clone(),
    )
    .await?;
    println!("Peer server listening on {}", server.local_addr());
    let server_task = tokio::spawn(server.run());

    let session = TrackerSession::connect(conf.tracker_addr, listen_addr)
        .await
        .map_err(|e| format!("could not connect to tracker: {}", e))?;
    println!("Connected to tracker at {}", conf.tracker_addr);

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupt received, shutting down peer");
            signal_shutdown.cancel();
        }
    });

    interactive_loop(session, &conf, &registry, &shutdown).await;

    shutdown.cancel();
    let _ = server_task.await;
    println!("Peer terminated.");
    Ok(())
}

/// What the select loop saw: either a typed command or a frame from the
/// tracker.
enum Event {
    Line(Option<String>),
    Push(Result<Reply, Error>),
}

/// Reads commands from standard input and drives the tracker session until
/// quit, shutdown, or disconnect.
async fn interactive_loop(
    mut session: TrackerSession,
    conf: &Conf,
    registry: &FileRegistry,
    shutdown: &CancellationToken,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt();
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = next_line(&mut lines) => Event::Line(line),
            reply = session.next_reply() => Event::Push(reply),
        };

        match event {
            Event::Line(None) => {
                // EOF on stdin ends the session like a quit
                let _ = session.quit().await;
                break;
            }
            Event::Line(Some(line)) => {
                if run_command(&mut session, conf, registry, &line).await {
                    break;
                }
            }
            // a frame arriving while idle can only be the shutdown push or
            // a tracker failure
            Event::Push(Ok(Reply::Shutdown)) => {
                println!("*** Tracker is shutting down. Disconnecting... ***");
                break;
            }
            Event::Push(Ok(Reply::Response(text))) => {
                print!("{}", text);
            }
            Event::Push(Err(_)) => {
                eprintln!("Error: Tracker closed the connection.");
                break;
            }
        }
    }
}

fn prompt() {
    use std::io::Write;
    print!(">> ");
    let _ = std::io::stdout().flush();
}

async fn next_line(lines: &mut Lines<BufReader<Stdin>>) -> Option<String> {
    lines.next_line().await.ok().flatten()
}

/// Executes one typed command. Returns true when the session is over.
///
/// The reserved client-side verbs are handled here: `login` is augmented
/// with our advertised endpoint, `upload_file` computes the manifest,
/// `download_file` runs the parallel downloader, and `quit`/`shutdown` end
/// the loop. Everything else goes to the tracker as-is.
async fn run_command(
    session: &mut TrackerSession,
    conf: &Conf,
    registry: &FileRegistry,
    line: &str,
) -> bool {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let outcome = match tokens.as_slice() {
        [] => Ok(false),
        ["login", user, password] => {
            session.login(user, password).await.map(print_reply)
        }
        ["login", ..] => {
            println!("Usage: login <user_id> <password>");
            Ok(false)
        }
        ["upload_file", file_path, group] => session
            .upload_file(registry, Path::new(file_path), group)
            .await
            .map(print_reply),
        ["upload_file", ..] => {
            println!("Usage: upload_file <file_path> <group_id>");
            Ok(false)
        }
        ["download_file", group, file_name, dest] => {
            download(session, conf, group, file_name, dest).await
        }
        ["download_file", ..] => {
            println!(
                "Usage: download_file <group_id> <file_name> \
                 <destination_path>"
            );
            Ok(false)
        }
        ["quit", ..] => {
            if let Ok(reply) = session.quit().await {
                print_reply(reply);
            }
            Ok(true)
        }
        ["shutdown", ..] => {
            // a locally typed shutdown only disconnects this peer
            println!("Disconnecting from tracker.");
            Ok(true)
        }
        _ => match Request::parse(line) {
            Ok(request) => {
                session.request(request).await.map(print_reply)
            }
            Err(e) => {
                println!("Error: {}", e);
                Ok(false)
            }
        },
    };

    match outcome {
        Ok(done) => done,
        Err(Error::Io(e)) => {
            println!("Error: {}", e);
            false
        }
        Err(Error::Download(e)) => {
            println!("Error: {}", e);
            false
        }
        Err(e) => {
            eprintln!("Error: Tracker connection failed: {}", e);
            true
        }
    }
}

/// Prints a reply; returns true when it was the shutdown push.
fn print_reply(reply: Reply) -> bool {
    match reply {
        Reply::Shutdown => {
            println!("*** Tracker is shutting down. Disconnecting... ***");
            true
        }
        Reply::Response(text) => {
            print!("{}", text);
            false
        }
    }
}

async fn download(
    session: &mut TrackerSession,
    conf: &Conf,
    group: &str,
    file_name: &str,
    dest: &str,
) -> Result<bool, Error> {
    let dest_dir = if Path::new(dest).is_absolute() {
        PathBuf::from(dest)
    } else {
        conf.download_dir.join(dest)
    };
    let outcome = session
        .download_file(group, file_name, &dest_dir, conf.download_workers)
        .await?;
    match outcome {
        DownloadOutcome::Complete(summary) => {
            if summary.verified {
                println!("File downloaded and verified successfully.");
            } else {
                println!(
                    "Warning: File verification failed for {}",
                    summary.path.display()
                );
            }
            Ok(false)
        }
        DownloadOutcome::Refused(text) => {
            println!("{}", text);
            Ok(false)
        }
        DownloadOutcome::Shutdown => {
            println!("*** Tracker is shutting down. Disconnecting... ***");
            Ok(true)
        }
    }
}
