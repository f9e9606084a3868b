//! End-to-end scenarios over localhost: a tracker and two or more peers,
//! each with its own chunk server, registry, and tracker session.

use std::{
    fs,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    task, time,
};
use tokio_util::sync::CancellationToken;

use swarmshare::{
    digest,
    peer::{DownloadOutcome, Reply, TrackerSession},
    peer_server::ChunkServer,
    plan::DownloadPlan,
    registry::FileRegistry,
    tracker::Tracker,
    wire::Request,
    CHUNK_LEN,
};

/// A scenario environment: a running tracker and a scratch directory unique
/// to the test.
struct Env {
    tracker_addr: SocketAddr,
    dir: PathBuf,
    shutdown: CancellationToken,
}

impl Env {
    async fn new(test_name: &str) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = std::env::temp_dir()
            .join(format!("swarmshare_swarm_test_{}", test_name));
        // clean up any previous run before recreating the scratch dir
        if dir.is_dir() {
            fs::remove_dir_all(&dir).unwrap();
        }
        fs::create_dir_all(&dir).unwrap();

        let shutdown = CancellationToken::new();
        let tracker =
            Tracker::bind("127.0.0.1:0".parse().unwrap(), shutdown.clone())
                .await
                .unwrap();
        let tracker_addr = tracker.local_addr();
        task::spawn(tracker.run());

        Self {
            tracker_addr,
            dir,
            shutdown,
        }
    }

    /// Writes a deterministic file into the scratch directory.
    fn make_file(&self, name: &str, len: usize) -> PathBuf {
        let contents: Vec<u8> = (0..len).map(|b| (b % 256) as u8).collect();
        let path = self.dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    /// Starts a peer: its registry, its chunk server, and a logged-in
    /// tracker session for a freshly created user.
    async fn start_peer(&self, user: &str) -> Peer {
        let registry = Arc::new(FileRegistry::new());
        let server = ChunkServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&registry),
            self.shutdown.clone(),
        )
        .await
        .unwrap();
        let listen_addr = server.local_addr();
        task::spawn(server.run());

        let mut session =
            TrackerSession::connect(self.tracker_addr, listen_addr)
                .await
                .unwrap();
        let reply = session
            .request(Request::CreateUser {
                user: user.into(),
                password: "pw".into(),
            })
            .await
            .unwrap();
        assert_eq!(reply.text(), "User created successfully.");
        let reply = session.login(user, "pw").await.unwrap();
        assert_eq!(reply.text(), "Login successful.");

        Peer { session, registry }
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let _ = fs::remove_dir_all(&self.dir);
    }
}

struct Peer {
    session: TrackerSession,
    registry: Arc<FileRegistry>,
}

/// Creates group `g` owned by the first peer with the rest as accepted
/// members.
async fn form_group(owner: &mut Peer, members: &mut [&mut Peer]) {
    let reply = owner
        .session
        .request(Request::CreateGroup { group: "g".into() })
        .await
        .unwrap();
    assert_eq!(reply.text(), "Group created successfully.");

    for member in members {
        let reply = member
            .session
            .request(Request::JoinGroup { group: "g".into() })
            .await
            .unwrap();
        assert_eq!(reply.text(), "Join request sent to group owner.");
    }

    loop {
        let reply = owner
            .session
            .request(Request::ListRequests { group: "g".into() })
            .await
            .unwrap();
        if reply.text() == "No pending requests." {
            break;
        }
        for user in reply.text().lines().skip(1) {
            let reply = owner
                .session
                .request(Request::AcceptRequest {
                    group: "g".into(),
                    user: user.into(),
                })
                .await
                .unwrap();
            assert_eq!(reply.text(), "User added to the group.");
        }
    }
}

// Uploads a 1,000,000 byte file from peer a and downloads it with peer b;
// the reassembled file must hash to the source's digest.
#[tokio::test]
async fn test_round_trip() {
    let env = Env::new("round_trip").await;
    let mut a = env.start_peer("a").await;
    let mut b = env.start_peer("b").await;
    form_group(&mut a, &mut [&mut b]).await;

    let source = env.make_file("f.bin", 1_000_000);
    let source_sha1 = digest::file_sha1(&source).unwrap();

    let reply = a
        .session
        .upload_file(&a.registry, &source, "g")
        .await
        .unwrap();
    assert_eq!(reply.text(), "File uploaded successfully.");

    let reply = b
        .session
        .request(Request::ListFiles { group: "g".into() })
        .await
        .unwrap();
    assert_eq!(reply.text(), "Files in group g:\nf.bin");

    let dest = env.dir.join("b_downloads");
    fs::create_dir_all(&dest).unwrap();
    let outcome = b
        .session
        .download_file("g", "f.bin", &dest, 4)
        .await
        .unwrap();
    match outcome {
        DownloadOutcome::Complete(summary) => {
            assert!(summary.verified);
            assert_eq!(
                digest::file_sha1(&summary.path).unwrap(),
                source_sha1
            );
        }
        other => panic!("expected completed download, got {:?}", other),
    }
}

// Uploads the same bytes from two peers; the tracker must collapse them into
// one file with both as holders of every chunk.
#[tokio::test]
async fn test_concurrent_upload_collapse() {
    let env = Env::new("upload_collapse").await;
    let mut a = env.start_peer("a").await;
    let mut b = env.start_peer("b").await;
    form_group(&mut a, &mut [&mut b]).await;

    let source_a = env.make_file("f.bin", CHUNK_LEN as usize + 5000);
    let b_dir = env.dir.join("b");
    fs::create_dir_all(&b_dir).unwrap();
    let source_b = b_dir.join("f.bin");
    fs::copy(&source_a, &source_b).unwrap();

    let (reply_a, reply_b) = tokio::join!(
        a.session.upload_file(&a.registry, &source_a, "g"),
        b.session.upload_file(&b.registry, &source_b, "g"),
    );
    let texts = [
        reply_a.unwrap().text().to_string(),
        reply_b.unwrap().text().to_string(),
    ];
    assert!(texts.contains(&"File uploaded successfully.".to_string()));
    assert!(texts
        .contains(&"File already exists. Added you as a sharer.".to_string()));

    // one file, two holders on every chunk
    let reply = a
        .session
        .request(Request::ListFiles { group: "g".into() })
        .await
        .unwrap();
    assert_eq!(reply.text(), "Files in group g:\nf.bin");

    let reply = a
        .session
        .request(Request::DownloadFile {
            group: "g".into(),
            name: "f.bin".into(),
        })
        .await
        .unwrap();
    let plan = DownloadPlan::parse(reply.text()).unwrap();
    assert_eq!(plan.total_chunks(), 2);
    for chunk in &plan.chunks {
        let holders: Vec<&str> =
            chunk.holders.iter().map(|h| h.user.as_str()).collect();
        assert_eq!(holders, ["a", "b"]);
    }
}

// A peer that serves garbage must be rejected by the digest check and the
// download completed from an honest holder.
#[tokio::test]
async fn test_integrity_rejection() {
    let env = Env::new("integrity").await;
    // user ids sort the malicious peer ahead of the honest one, so the
    // downloader tries it first
    let mut evil = env.start_peer("a_evil").await;
    let mut honest = env.start_peer("b_honest").await;
    let mut downloader = env.start_peer("c_downloader").await;
    form_group(&mut evil, &mut [&mut honest, &mut downloader]).await;

    let source = env.make_file("f.bin", 200_000);

    // the malicious peer announces the real manifest, then its backing file
    // is swapped for zeros so it keeps serving well-formed but corrupt
    // chunks
    let reply = evil
        .session
        .upload_file(&evil.registry, &source, "g")
        .await
        .unwrap();
    assert_eq!(reply.text(), "File uploaded successfully.");
    poison_registry(&evil.registry, &env, "f.bin").await;

    let honest_dir = env.dir.join("honest");
    fs::create_dir_all(&honest_dir).unwrap();
    let honest_copy = honest_dir.join("f.bin");
    fs::copy(&source, &honest_copy).unwrap();
    let reply = honest
        .session
        .upload_file(&honest.registry, &honest_copy, "g")
        .await
        .unwrap();
    assert_eq!(
        reply.text(),
        "File already exists. Added you as a sharer."
    );

    let dest = env.dir.join("downloads");
    fs::create_dir_all(&dest).unwrap();
    let outcome = downloader
        .session
        .download_file("g", "f.bin", &dest, 2)
        .await
        .unwrap();
    match outcome {
        DownloadOutcome::Complete(summary) => {
            assert!(summary.verified);
            assert_eq!(
                digest::file_sha1(&summary.path).unwrap(),
                digest::file_sha1(&source).unwrap()
            );
        }
        other => panic!("expected completed download, got {:?}", other),
    }
}

/// Replaces a shared file's backing bytes with zeros of the same length, so
/// the peer keeps serving well-formed chunks that cannot pass verification.
async fn poison_registry(registry: &FileRegistry, env: &Env, name: &str) {
    let file = registry.get(name).await.unwrap();
    let poisoned = env.dir.join("poisoned.bin");
    fs::write(&poisoned, vec![0u8; file.len as usize]).unwrap();
    let mut poisoned_file = (*file).clone();
    poisoned_file.path = poisoned;
    registry.insert(poisoned_file).await;
}

// A dropped connection logs the user out; later plans must not list their
// endpoint.
#[tokio::test]
async fn test_session_cleanup_excludes_dropped_holder() {
    let env = Env::new("session_cleanup").await;
    let mut a = env.start_peer("a").await;
    let mut b = env.start_peer("b").await;
    form_group(&mut a, &mut [&mut b]).await;

    let source = env.make_file("f.bin", 100_000);
    let reply = b
        .session
        .upload_file(&b.registry, &source, "g")
        .await
        .unwrap();
    assert_eq!(reply.text(), "File uploaded successfully.");

    // b's connection drops without a quit
    drop(b);

    // disconnect cleanup is asynchronous; poll until the plan reflects it
    let mut holders_gone = false;
    for _ in 0..100 {
        let reply = a
            .session
            .request(Request::DownloadFile {
                group: "g".into(),
                name: "f.bin".into(),
            })
            .await
            .unwrap();
        let plan = DownloadPlan::parse(reply.text()).unwrap();
        if plan.chunks.iter().all(|chunk| chunk.holders.is_empty()) {
            holders_gone = true;
            break;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    assert!(holders_gone, "dropped holder still listed in plan");
}

// The tracker refuses commands that need a session before login, and quit
// ends the session with a goodbye.
#[tokio::test]
async fn test_login_required_and_quit() {
    let env = Env::new("login_required").await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen_addr = listener.local_addr().unwrap();
    drop(listener);

    let mut session = TrackerSession::connect(env.tracker_addr, listen_addr)
        .await
        .unwrap();
    let reply = session
        .request(Request::CreateGroup { group: "g".into() })
        .await
        .unwrap();
    assert_eq!(reply.text(), "Error: Please login first.");

    // client-issued shutdown is refused
    let reply = session.request(Request::Shutdown).await.unwrap();
    assert_eq!(
        reply.text(),
        "Error: Shutdown is only accepted on the tracker console."
    );

    let reply = session.quit().await.unwrap();
    assert_eq!(reply.text(), "Goodbye!");
}

// A console shutdown pushes a shutdown line to every connected session.
#[tokio::test]
async fn test_shutdown_push() {
    let env = Env::new("shutdown_push").await;
    let mut a = env.start_peer("a").await;

    env.shutdown.cancel();
    let reply = a.session.next_reply().await.unwrap();
    assert_eq!(reply, Reply::Shutdown);
}

// The raw peer-to-peer protocol: a downloader that reads a whole advertised
// chunk gets exactly the right bytes off the chunk server.
#[tokio::test]
async fn test_chunk_boundaries_on_the_wire() {
    let env = Env::new("chunk_boundaries").await;
    let mut a = env.start_peer("a").await;
    let mut b = env.start_peer("b").await;
    form_group(&mut a, &mut [&mut b]).await;

    // exactly one full chunk plus one byte
    let source = env.make_file("f.bin", CHUNK_LEN as usize + 1);
    a.session
        .upload_file(&a.registry, &source, "g")
        .await
        .unwrap();

    let reply = b
        .session
        .request(Request::DownloadFile {
            group: "g".into(),
            name: "f.bin".into(),
        })
        .await
        .unwrap();
    let plan = DownloadPlan::parse(reply.text()).unwrap();
    assert_eq!(plan.total_chunks(), 2);
    assert_eq!(plan.expected_len(0), CHUNK_LEN);
    assert_eq!(plan.expected_len(1), 1);

    // fetch the final one byte chunk by hand
    let holder = &plan.chunks[1].holders[0];
    let mut socket =
        tokio::net::TcpStream::connect(holder.addr).await.unwrap();
    socket
        .write_all(swarmshare::wire::get_chunk_line("f.bin", 1).as_bytes())
        .await
        .unwrap();
    let mut data = Vec::new();
    socket.read_to_end(&mut data).await.unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(digest::sha1_hex(&data), plan.chunks[1].sha1);
}
