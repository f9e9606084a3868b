//! The tracker's in-memory metadata tables: users, groups, group files, and
//! the session bindings of currently connected clients.
//!
//! Two locks guard the state: one over the group table (groups and their
//! files) and one over the user table (user records and session bindings).
//! Whenever both are held the order is always groups before users;
//! `download_file` holds both read guards to emit a consistent snapshot of
//! holder endpoints. No method awaits while holding a guard. Nothing is
//! persisted; tracker state lives and dies with the process.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    net::SocketAddr,
    sync::RwLock,
};

use crate::{
    chunk_count,
    plan::{plan_header, ChunkPlan, DownloadPlan, Holder},
    ChunkIndex, GroupId, UserId,
};

/// Identifies one client connection. Assigned by the accept loop, unique for
/// the tracker's lifetime.
pub type SessionId = u64;

/// A registered user.
#[derive(Debug)]
struct User {
    password: String,
    /// The chunk server endpoint advertised at login. `Some` exactly while
    /// the user is logged in.
    endpoint: Option<SocketAddr>,
}

/// A named group of users.
#[derive(Debug)]
struct Group {
    owner: UserId,
    members: HashSet<UserId>,
    /// Join requests awaiting the owner's decision, in arrival order.
    pending: Vec<UserId>,
    /// Files published into the group, in upload order.
    files: Vec<StoredFile>,
}

impl Group {
    fn new(owner: UserId) -> Self {
        let mut members = HashSet::new();
        members.insert(owner.clone());
        Self {
            owner,
            members,
            pending: Vec::new(),
            files: Vec::new(),
        }
    }
}

/// A file published into a group: its manifest plus who owns which chunks.
#[derive(Debug)]
struct StoredFile {
    name: String,
    len: u64,
    sha1: String,
    chunk_sha1s: Vec<String>,
    /// Which chunk indices each sharer owns. Every index is in
    /// `[0, chunk_sha1s.len())`.
    owners: HashMap<UserId, HashSet<ChunkIndex>>,
}

impl StoredFile {
    /// The full chunk index set, what an uploader owns.
    fn all_chunks(&self) -> HashSet<ChunkIndex> {
        (0..self.chunk_sha1s.len()).collect()
    }
}

#[derive(Debug, Default)]
struct UserTable {
    users: HashMap<UserId, User>,
    /// Which user each live session is bound to.
    sessions: HashMap<SessionId, UserId>,
}

/// The tracker's metadata store.
#[derive(Debug, Default)]
pub struct Store {
    // Lock order: `groups` before `users`, always.
    groups: RwLock<HashMap<GroupId, Group>>,
    users: RwLock<UserTable>,
}

/// A store operation that was refused. `Display` renders the reason exactly
/// as it appears after the `Error: ` prefix on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreError {
    UserExists,
    NoSuchUser,
    WrongPassword,
    AlreadyLoggedIn,
    NotLoggedIn,
    GroupExists,
    NoSuchGroup,
    AlreadyMember,
    NotAMember,
    OwnerCannotLeave,
    OnlyOwnerListsRequests,
    OnlyOwnerAccepts,
    NoSuchRequest,
    NoFiles,
    NoSuchFile,
    ManifestMismatch,
}

impl fmt::Display for StoreError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use StoreError::*;
        let msg = match self {
            UserExists => "User already exists.",
            NoSuchUser => "User does not exist.",
            WrongPassword => "Incorrect password.",
            AlreadyLoggedIn => "User already logged in.",
            NotLoggedIn => "Please login first.",
            GroupExists => "Group already exists.",
            NoSuchGroup => "Group does not exist.",
            AlreadyMember => "Already a member of the group.",
            NotAMember => "Not a member of the group.",
            OwnerCannotLeave => "Group owner cannot leave the group.",
            OnlyOwnerListsRequests => {
                "Only group owner can view pending requests."
            }
            OnlyOwnerAccepts => "Only group owner can accept requests.",
            NoSuchRequest => "No such pending request.",
            NoFiles => "No files available in the group.",
            NoSuchFile => "File not found in the group.",
            ManifestMismatch => "Chunk count does not match file size.",
        };
        write!(fmt, "{}", msg)
    }
}

impl std::error::Error for StoreError {}

/// What `upload_file` did with the manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    /// A new file entry was created with the caller as sole owner.
    Created,
    /// The file was already known; the caller was added as a sharer owning
    /// every chunk.
    AddedAsSharer,
    /// The caller was already a sharer of this file.
    AlreadySharing,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new user. The only operation that needs no session.
    pub fn create_user(
        &self,
        user: &str,
        password: &str,
    ) -> Result<(), StoreError> {
        let mut table = self.users.write().unwrap();
        if table.users.contains_key(user) {
            return Err(StoreError::UserExists);
        }
        table.users.insert(
            user.to_string(),
            User {
                password: password.to_string(),
                endpoint: None,
            },
        );
        log::info!("Created user {}", user);
        Ok(())
    }

    /// Verifies the password, marks the user logged in at the given chunk
    /// server endpoint, and binds the session to the user.
    pub fn login(
        &self,
        session: SessionId,
        user: &str,
        password: &str,
        endpoint: SocketAddr,
    ) -> Result<(), StoreError> {
        let mut table = self.users.write().unwrap();
        if table.sessions.contains_key(&session) {
            return Err(StoreError::AlreadyLoggedIn);
        }
        let record =
            table.users.get_mut(user).ok_or(StoreError::NoSuchUser)?;
        if record.password != password {
            return Err(StoreError::WrongPassword);
        }
        if record.endpoint.is_some() {
            return Err(StoreError::AlreadyLoggedIn);
        }
        record.endpoint = Some(endpoint);
        table.sessions.insert(session, user.to_string());
        log::info!("User {} logged in from {}", user, endpoint);
        Ok(())
    }

    /// Disconnect cleanup: logs out whatever user the session was bound to
    /// and clears its endpoint. Idempotent.
    pub fn logout_session(&self, session: SessionId) {
        let mut table = self.users.write().unwrap();
        if let Some(user) = table.sessions.remove(&session) {
            if let Some(record) = table.users.get_mut(&user) {
                record.endpoint = None;
            }
            log::info!("User {} logged out", user);
        }
    }

    /// Resolves the user a session is bound to.
    fn bound_user(&self, session: SessionId) -> Result<UserId, StoreError> {
        self.users
            .read()
            .unwrap()
            .sessions
            .get(&session)
            .cloned()
            .ok_or(StoreError::NotLoggedIn)
    }

    /// Creates a group with the caller as owner and sole member.
    pub fn create_group(
        &self,
        session: SessionId,
        group: &str,
    ) -> Result<(), StoreError> {
        let user = self.bound_user(session)?;
        let mut groups = self.groups.write().unwrap();
        if groups.contains_key(group) {
            return Err(StoreError::GroupExists);
        }
        groups.insert(group.to_string(), Group::new(user.clone()));
        log::info!("User {} created group {}", user, group);
        Ok(())
    }

    /// Queues a join request for the group owner. Repeating the request is
    /// harmless: the pending entry is not duplicated.
    pub fn join_group(
        &self,
        session: SessionId,
        group: &str,
    ) -> Result<(), StoreError> {
        let user = self.bound_user(session)?;
        let mut groups = self.groups.write().unwrap();
        let group = groups.get_mut(group).ok_or(StoreError::NoSuchGroup)?;
        if group.members.contains(&user) {
            return Err(StoreError::AlreadyMember);
        }
        if !group.pending.contains(&user) {
            group.pending.push(user);
        }
        Ok(())
    }

    /// Removes the caller from the group's members. The owner cannot leave.
    pub fn leave_group(
        &self,
        session: SessionId,
        group: &str,
    ) -> Result<(), StoreError> {
        let user = self.bound_user(session)?;
        let mut groups = self.groups.write().unwrap();
        let group = groups.get_mut(group).ok_or(StoreError::NoSuchGroup)?;
        if group.owner == user {
            return Err(StoreError::OwnerCannotLeave);
        }
        if !group.members.remove(&user) {
            return Err(StoreError::NotAMember);
        }
        Ok(())
    }

    /// Returns all group ids, sorted.
    pub fn list_groups(&self) -> Vec<GroupId> {
        let groups = self.groups.read().unwrap();
        let mut ids: Vec<GroupId> = groups.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the group's pending join requests in arrival order.
    /// Owner only.
    pub fn list_requests(
        &self,
        session: SessionId,
        group: &str,
    ) -> Result<Vec<UserId>, StoreError> {
        let user = self.bound_user(session)?;
        let groups = self.groups.read().unwrap();
        let group = groups.get(group).ok_or(StoreError::NoSuchGroup)?;
        if group.owner != user {
            return Err(StoreError::OnlyOwnerListsRequests);
        }
        Ok(group.pending.clone())
    }

    /// Moves a pending requester into the group's members. Owner only;
    /// accepting a user with no pending request is an error.
    pub fn accept_request(
        &self,
        session: SessionId,
        group: &str,
        user: &str,
    ) -> Result<(), StoreError> {
        let owner = self.bound_user(session)?;
        let mut groups = self.groups.write().unwrap();
        let group = groups.get_mut(group).ok_or(StoreError::NoSuchGroup)?;
        if group.owner != owner {
            return Err(StoreError::OnlyOwnerAccepts);
        }
        let position = group
            .pending
            .iter()
            .position(|pending| pending == user)
            .ok_or(StoreError::NoSuchRequest)?;
        group.pending.remove(position);
        group.members.insert(user.to_string());
        log::info!("User {} accepted into group", user);
        Ok(())
    }

    /// Returns the names of the group's files in upload order. Member only.
    pub fn list_files(
        &self,
        session: SessionId,
        group: &str,
    ) -> Result<Vec<String>, StoreError> {
        let user = self.bound_user(session)?;
        let groups = self.groups.read().unwrap();
        let group = groups.get(group).ok_or(StoreError::NoSuchGroup)?;
        if !group.members.contains(&user) {
            return Err(StoreError::NotAMember);
        }
        Ok(group.files.iter().map(|file| file.name.clone()).collect())
    }

    /// Records a file manifest in the group. Two uploads of the same
    /// `(name, sha1)` collapse into one file with both callers as owners of
    /// every chunk.
    pub fn upload_file(
        &self,
        session: SessionId,
        group: &str,
        name: &str,
        len: u64,
        file_sha1: &str,
        chunk_sha1s: Vec<String>,
    ) -> Result<UploadOutcome, StoreError> {
        let user = self.bound_user(session)?;
        let mut groups = self.groups.write().unwrap();
        let group_entry =
            groups.get_mut(group).ok_or(StoreError::NoSuchGroup)?;
        if !group_entry.members.contains(&user) {
            return Err(StoreError::NotAMember);
        }
        if chunk_count(len) != chunk_sha1s.len() {
            return Err(StoreError::ManifestMismatch);
        }

        if let Some(file) = group_entry
            .files
            .iter_mut()
            .find(|file| file.name == name && file.sha1 == file_sha1)
        {
            if file.owners.contains_key(&user) {
                return Ok(UploadOutcome::AlreadySharing);
            }
            let chunks = file.all_chunks();
            file.owners.insert(user.clone(), chunks);
            log::info!(
                "User {} now shares {} in group {}",
                user,
                name,
                group
            );
            return Ok(UploadOutcome::AddedAsSharer);
        }

        let mut file = StoredFile {
            name: name.to_string(),
            len,
            sha1: file_sha1.to_string(),
            chunk_sha1s,
            owners: HashMap::new(),
        };
        let chunks = file.all_chunks();
        file.owners.insert(user.clone(), chunks);
        group_entry.files.push(file);
        log::info!("User {} uploaded {} to group {}", user, name, group);
        Ok(UploadOutcome::Created)
    }

    /// Synthesizes the download plan for a file: for every chunk, the
    /// endpoints of all currently logged-in owners. Member only.
    ///
    /// The plan reflects the state at the moment both table locks are held;
    /// it is an owned snapshot, not a live view.
    pub fn download_file(
        &self,
        session: SessionId,
        group: &str,
        name: &str,
    ) -> Result<DownloadPlan, StoreError> {
        let user = self.bound_user(session)?;
        // groups first, then users, per the lock order
        let groups = self.groups.read().unwrap();
        let group = groups.get(group).ok_or(StoreError::NoSuchGroup)?;
        if !group.members.contains(&user) {
            return Err(StoreError::NotAMember);
        }
        if group.files.is_empty() {
            return Err(StoreError::NoFiles);
        }
        let file = group
            .files
            .iter()
            .find(|file| file.name == name)
            .ok_or(StoreError::NoSuchFile)?;

        let users = self.users.read().unwrap();
        let mut plan = plan_header(file.len, file.sha1.clone());
        for (index, sha1) in file.chunk_sha1s.iter().enumerate() {
            // deterministic holder order: sorted by user id
            let mut owners: Vec<&UserId> = file
                .owners
                .iter()
                .filter(|(_, chunks)| chunks.contains(&index))
                .map(|(owner, _)| owner)
                .collect();
            owners.sort();

            let holders = owners
                .into_iter()
                .filter_map(|owner| {
                    let endpoint = users.users.get(owner)?.endpoint?;
                    Some(Holder {
                        user: owner.clone(),
                        addr: endpoint,
                    })
                })
                .collect();
            plan.chunks.push(ChunkPlan {
                index,
                sha1: sha1.clone(),
                holders,
            });
        }
        Ok(plan)
    }
}
