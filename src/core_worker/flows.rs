// Séquences de commandes par élément de la file
// `Err` : l'échange a échoué, le worker décide de réessayer ; `Ok` : résultat définitif

use crate::config::{AsciiForBinary, ExistingTarget};
use crate::core_disk::DiskFlusher;
use crate::core_error::FtpError;
use crate::core_ftpcommand::{FtpCommand, TransferType};
use crate::core_listing::{parse_listing, EntryKind};
use crate::core_network::{CommandOptions, ControlConnection, DataConnection, DataSink, DataSource};
use crate::core_path::{vms_dir_name, ServerPathType};
use crate::core_queue::{ItemKind, ProblemCode, QueueItem};
use crate::core_worker::state::{Job, Outcome};
use crate::core_worker::worker::WorkerContext;
use log::{debug, info, warn};
use std::path::Path;

/// Kind of the item created for one listing entry of an explored directory.
pub fn child_kind(explore: ItemKind, entry: EntryKind) -> Option<ItemKind> {
    use ItemKind::*;
    let kinds = match explore {
        DeleteExploreDir => (DeleteFile, DeleteExploreDir, DeleteLink),
        CopyExploreDir => (CopyFile, CopyExploreDir, CopyResolveLink),
        MoveExploreDir => (MoveFile, MoveExploreDir, MoveResolveLink),
        ChAttrsExploreDir => (ChAttrsFile, ChAttrsExploreDir, ChAttrsResolveLink),
        _ => return None,
    };
    Some(match entry {
        EntryKind::File => kinds.0,
        EntryKind::Directory => kinds.1,
        EntryKind::Link => kinds.2,
    })
}

/// Item finishing an explored directory once all of its content is done.
pub fn trailing_kind(explore: ItemKind) -> Option<ItemKind> {
    match explore {
        ItemKind::DeleteExploreDir => Some(ItemKind::DeleteDir),
        ItemKind::MoveExploreDir => Some(ItemKind::MoveDeleteDir),
        ItemKind::ChAttrsExploreDir => Some(ItemKind::ChAttrsDir),
        ItemKind::UploadMoveExploreDir => Some(ItemKind::UploadMoveDeleteDir),
        _ => None,
    }
}

/// What a link turns into: (pointing at a directory, pointing at a file).
fn resolved_kinds(link: ItemKind) -> Option<(ItemKind, ItemKind)> {
    match link {
        ItemKind::CopyResolveLink => Some((ItemKind::CopyExploreDir, ItemKind::CopyFile)),
        ItemKind::MoveResolveLink => Some((ItemKind::MoveExploreDir, ItemKind::MoveFile)),
        ItemKind::ChAttrsResolveLink => Some((ItemKind::ChAttrsExploreDir, ItemKind::ChAttrsFile)),
        _ => None,
    }
}

fn unexpected(detail: impl Into<String>) -> Outcome {
    Outcome::Failed {
        problem: ProblemCode::Unexpected,
        detail: detail.into(),
    }
}

/// Removes the local directory left empty by an upload-move. Needs no server.
pub async fn remove_local_dir(item: &QueueItem) -> Outcome {
    let Some(dir) = item.local_path() else {
        return unexpected("no local directory");
    };
    match tokio::fs::remove_dir(&dir).await {
        Ok(()) => {
            debug!("Removed local directory {}", dir.display());
            Outcome::Done
        }
        Err(e) => Outcome::Failed {
            problem: ProblemCode::SourceFileError,
            detail: format!("{}: {}", dir.display(), e),
        },
    }
}

pub struct ItemFlow<'a> {
    ctx: &'a WorkerContext,
    conn: &'a ControlConnection,
    opts: CommandOptions,
}

impl<'a> ItemFlow<'a> {
    pub fn new(ctx: &'a WorkerContext, conn: &'a ControlConnection, opts: CommandOptions) -> Self {
        Self { ctx, conn, opts }
    }

    pub async fn run(&self, job: &mut Job) -> Result<Outcome, FtpError> {
        use ItemKind::*;
        match job.item.kind {
            DeleteFile | DeleteLink => self.delete_file(&job.item).await,
            DeleteDir | MoveDeleteDir => self.delete_dir(&job.item).await,
            DeleteExploreDir | CopyExploreDir | MoveExploreDir | ChAttrsExploreDir => {
                self.explore(&job.item).await
            }
            CopyResolveLink | MoveResolveLink | ChAttrsResolveLink => self.resolve_link(&job.item).await,
            ChAttrsFile | ChAttrsDir => self.change_attrs(&job.item).await,
            CopyFile | MoveFile => self.download(job).await,
            UploadCopyExploreDir | UploadMoveExploreDir => self.upload_explore(&job.item).await,
            UploadCopyFile | UploadMoveFile => self.upload(job).await,
            UploadMoveDeleteDir => Ok(remove_local_dir(&job.item).await),
        }
    }

    fn path_type(&self) -> ServerPathType {
        self.conn.path_type()
    }

    /// Drops cached listings of `path` and below after a change on the server.
    fn invalidate(&self, path: &str) {
        self.ctx.cache.invalidate_subtree(
            self.conn.host(),
            self.conn.port(),
            self.conn.user(),
            self.path_type(),
            path,
        );
    }

    fn new_child(&self, parent: &QueueItem, kind: ItemKind, path: &str, name: &str) -> QueueItem {
        let mut child = QueueItem::new(kind, path, name);
        child.uid = self.ctx.queue.alloc_uid();
        child.parent = Some(parent.uid);
        child.mode = parent.mode;
        child
    }

    async fn send(&self, cmd: FtpCommand) -> Result<crate::core_reply::FtpReply, FtpError> {
        self.conn.send_command(&cmd, &self.opts).await
    }

    async fn delete_file(&self, item: &QueueItem) -> Result<Outcome, FtpError> {
        self.conn.change_working_path(&item.path, &self.opts).await?;
        let reply = self.send(FtpCommand::DELE(item.name.clone())).await?;
        if reply.is_success() {
            self.invalidate(&item.path);
            return Ok(Outcome::Done);
        }
        if item.kind == ItemKind::DeleteLink && reply.is_permanent_error() {
            // Some servers only remove a link to a directory with RMD.
            let rmd = self.send(FtpCommand::RMD(item.name.clone())).await?;
            if rmd.is_success() {
                self.invalidate(&item.path);
                return Ok(Outcome::Done);
            }
        }
        Err(FtpError::Server(reply))
    }

    async fn delete_dir(&self, item: &QueueItem) -> Result<Outcome, FtpError> {
        self.conn.change_working_path(&item.path, &self.opts).await?;
        let name = if self.path_type() == ServerPathType::OpenVms {
            vms_dir_name(&item.name)
        } else {
            item.name.clone()
        };
        let reply = self.send(FtpCommand::RMD(name)).await?;
        if !reply.is_success() {
            return Err(FtpError::Server(reply));
        }
        self.invalidate(&item.path);
        Ok(Outcome::Done)
    }

    async fn change_attrs(&self, item: &QueueItem) -> Result<Outcome, FtpError> {
        let Some(mode) = item.mode else {
            return Ok(unexpected("no permissions given"));
        };
        self.conn.change_working_path(&item.path, &self.opts).await?;
        let mut reply = self
            .send(FtpCommand::CHMOD {
                mode,
                name: item.name.clone(),
                quoted: false,
            })
            .await?;
        if reply.is_syntax_error() && item.name.contains(char::is_whitespace) {
            debug!("Retrying SITE CHMOD with a quoted name");
            reply = self
                .send(FtpCommand::CHMOD {
                    mode,
                    name: item.name.clone(),
                    quoted: true,
                })
                .await?;
        }
        if !reply.is_success() {
            return Err(FtpError::Server(reply));
        }
        self.invalidate(&item.path);
        Ok(Outcome::Done)
    }

    async fn explore(&self, item: &QueueItem) -> Result<Outcome, FtpError> {
        let Some(dir) = self.path_type().append(&item.path, &item.name, true) else {
            return Ok(unexpected(format!("cannot build the path of {}", item.name)));
        };

        let local_dir = match item.kind {
            ItemKind::CopyExploreDir | ItemKind::MoveExploreDir => {
                let Some(local) = item.local_path() else {
                    return Ok(unexpected("no local target directory"));
                };
                if let Err(e) = tokio::fs::create_dir_all(&local).await {
                    return Ok(Outcome::Failed {
                        problem: ProblemCode::CannotCreateTargetFile,
                        detail: format!("{}: {}", local.display(), e),
                    });
                }
                Some(local)
            }
            _ => None,
        };

        let listing = self
            .conn
            .list_cached(&self.ctx.cache, &dir, false, &self.opts)
            .await?;
        let entries = parse_listing(&listing);
        debug!("{} holds {} entries", dir, entries.len());

        let mut children = Vec::with_capacity(entries.len() + 1);
        for entry in entries {
            let Some(kind) = child_kind(item.kind, entry.kind) else {
                continue;
            };
            let mut child = self.new_child(item, kind, &dir, &entry.name);
            child.local_dir = local_dir.clone();
            if entry.kind == EntryKind::File {
                child.size = Some(entry.size);
            }
            children.push(child);
        }
        self.finish_expansion(item, children)
    }

    fn finish_expansion(&self, item: &QueueItem, mut children: Vec<QueueItem>) -> Result<Outcome, FtpError> {
        if let Some(kind) = trailing_kind(item.kind) {
            let mut last = self.new_child(item, kind, &item.path, &item.name);
            last.local_dir = item.local_dir.clone();
            last.depends_on = children.iter().map(|child| child.uid).collect();
            children.push(last);
        }
        if children.is_empty() {
            return Ok(Outcome::Done);
        }
        Ok(Outcome::Replaced(children))
    }

    /// `CWD` into the link: success means a directory. A permanent refusal is
    /// taken as a file, though it may be a directory we are not allowed into.
    async fn resolve_link(&self, item: &QueueItem) -> Result<Outcome, FtpError> {
        let Some((dir_kind, file_kind)) = resolved_kinds(item.kind) else {
            return Ok(unexpected("not a link item"));
        };
        let Some(dir) = self.path_type().append(&item.path, &item.name, true) else {
            return Ok(unexpected(format!("cannot build the path of {}", item.name)));
        };
        let kind = match self.conn.change_working_path(&dir, &self.opts).await {
            Ok(()) => dir_kind,
            Err(FtpError::Server(reply)) if reply.is_permanent_error() => file_kind,
            Err(e) => return Err(e),
        };
        debug!("Link {} resolved as {:?}", item.name, kind);
        let mut child = self.new_child(item, kind, &item.path, &item.name);
        child.local_dir = item.local_dir.clone();
        child.size = item.size;
        Ok(Outcome::Replaced(vec![child]))
    }

    async fn download(&self, job: &mut Job) -> Result<Outcome, FtpError> {
        let Some(target) = job.item.local_path() else {
            return Ok(unexpected("no local target"));
        };
        let name = job.item.name.clone();
        let policy = self.ctx.config.transfer.ascii_for_binary;
        self.conn.change_working_path(&job.item.path, &self.opts).await?;

        loop {
            self.conn.set_transfer_mode(job.transfer, &self.opts).await?;
            let flusher = DiskFlusher::create(&target, job.resume_from.is_some()).await?;
            let check_ascii = job.transfer == TransferType::Ascii && policy != AsciiForBinary::Ignore;
            let mut data = DataConnection::download(DataSink::File(flusher), self.conn.params().no_data_timeout)
                .with_compression(self.conn.compress_enabled())
                .with_ascii_check(check_ascii);
            let reply = self
                .conn
                .transfer(&FtpCommand::RETR(name.clone()), job.resume_from, &mut data, &self.opts)
                .await?;
            if !reply.is_success() {
                return Err(FtpError::Server(reply));
            }
            if let Some(e) = data.first_error() {
                return Err(e.clone().into());
            }
            if data.binary_detected() {
                match policy {
                    AsciiForBinary::Fail => {
                        return Ok(Outcome::Failed {
                            problem: ProblemCode::AsciiTransferForBinary,
                            detail: format!("{} is not a text file", name),
                        })
                    }
                    AsciiForBinary::Binary => {
                        info!("{} is binary, downloading it again in binary mode", name);
                        job.transfer = TransferType::Binary;
                        job.resume_from = None;
                        continue;
                    }
                    AsciiForBinary::Ignore => {}
                }
            }
            debug!("Downloaded {} ({} bytes)", name, data.stats().bytes());
            break;
        }

        if job.item.kind == ItemKind::MoveFile {
            let reply = self.send(FtpCommand::DELE(name)).await?;
            if !reply.is_success() {
                return Err(FtpError::Server(reply));
            }
            self.invalidate(&job.item.path);
        }
        Ok(Outcome::Done)
    }

    async fn upload(&self, job: &mut Job) -> Result<Outcome, FtpError> {
        let Some(source) = job.item.local_path() else {
            return Ok(unexpected("no local source"));
        };
        let name = job.item.name.clone();
        self.conn.change_working_path(&job.item.path, &self.opts).await?;
        self.conn.set_transfer_mode(job.transfer, &self.opts).await?;

        let mut offset = 0;
        let size = self.send(FtpCommand::SIZE(name.clone())).await?;
        if size.is_success() {
            match self.ctx.config.transfer.existing_target {
                ExistingTarget::Skip => {
                    return Ok(Outcome::Skipped {
                        problem: ProblemCode::TargetExists,
                        detail: format!("{} already exists on the server", name),
                    })
                }
                ExistingTarget::Resume => match size.message().trim().parse() {
                    Ok(existing) => offset = existing,
                    Err(_) => warn!(
                        "Unusable SIZE reply for {} ({}), uploading it from the start",
                        name,
                        size.text()
                    ),
                },
                ExistingTarget::Overwrite => {}
            }
        }

        let cmd = if offset > 0 {
            FtpCommand::APPE(name.clone())
        } else {
            FtpCommand::STOR(name.clone())
        };
        let from_disk = DataSource::File {
            path: source.clone(),
            offset,
        };
        let mut data = DataConnection::upload(from_disk, self.conn.params().no_data_timeout)
            .with_compression(self.conn.compress_enabled());
        let reply = self.conn.transfer(&cmd, None, &mut data, &self.opts).await?;
        if !reply.is_success() {
            return Err(FtpError::Server(reply));
        }
        if let Some(e) = data.first_error() {
            return Err(e.clone().into());
        }
        self.invalidate(&job.item.path);
        debug!("Uploaded {} ({} bytes)", name, data.stats().bytes());

        if job.item.kind == ItemKind::UploadMoveFile {
            if let Err(e) = tokio::fs::remove_file(&source).await {
                return Ok(Outcome::Failed {
                    problem: ProblemCode::SourceFileError,
                    detail: format!("{}: {}", source.display(), e),
                });
            }
        }
        Ok(Outcome::Done)
    }

    async fn upload_explore(&self, item: &QueueItem) -> Result<Outcome, FtpError> {
        let Some(source_dir) = item.local_path() else {
            return Ok(unexpected("no local source"));
        };
        let Some(remote_dir) = self.path_type().append(&item.path, &item.name, true) else {
            return Ok(unexpected(format!("cannot build the path of {}", item.name)));
        };

        self.conn.change_working_path(&item.path, &self.opts).await?;
        let mkd = self.send(FtpCommand::MKD(item.name.clone())).await?;
        if mkd.is_success() {
            self.invalidate(&item.path);
        } else {
            // Fine when the directory is already there.
            match self.conn.change_working_path(&remote_dir, &self.opts).await {
                Ok(()) => {}
                Err(FtpError::Server(_)) => return Err(FtpError::Server(mkd)),
                Err(e) => return Err(e),
            }
        }

        let children = match self.local_children(item, &source_dir, &remote_dir).await {
            Ok(children) => children,
            Err(e) => {
                return Ok(Outcome::Failed {
                    problem: ProblemCode::SourceFileError,
                    detail: format!("{}: {}", source_dir.display(), e),
                })
            }
        };
        self.finish_expansion(item, children)
    }

    async fn local_children(
        &self,
        item: &QueueItem,
        source_dir: &Path,
        remote_dir: &str,
    ) -> std::io::Result<Vec<QueueItem>> {
        let (dir_kind, file_kind) = match item.kind {
            ItemKind::UploadMoveExploreDir => (ItemKind::UploadMoveExploreDir, ItemKind::UploadMoveFile),
            _ => (ItemKind::UploadCopyExploreDir, ItemKind::UploadCopyFile),
        };
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(source_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = match tokio::fs::metadata(entry.path()).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            found.push((name, metadata.is_dir(), metadata.len()));
        }
        found.sort();

        Ok(found
            .into_iter()
            .map(|(name, is_dir, len)| {
                let kind = if is_dir { dir_kind } else { file_kind };
                let mut child = self.new_child(item, kind, remote_dir, &name).with_local_dir(source_dir);
                if !is_dir {
                    child.size = Some(len);
                }
                child
            })
            .collect())
    }
}
