//! Git mirrors.
//!
//! A mirror URL of the form `git+<transport>://host/repo.git#<rev>` names a
//! repository and a revision (commit, tag or branch; the remote's HEAD when
//! omitted). The checked-out tree, without `.git`, is the artifact.

use std::path::Path;

use anyhow::{bail, Context, Result};
use git2::{Commit, Repository, ResetType};
use url::Url;

use crate::util::fs::remove_dir_all_if_exists;

/// URL scheme prefix marking a git mirror.
pub const GIT_PREFIX: &str = "git+";

/// A parsed git mirror URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitMirror {
    /// Clone URL with the `git+` prefix and fragment removed
    pub remote: String,
    /// Requested revision, if any
    pub rev: Option<String>,
}

impl GitMirror {
    pub fn parse(raw: &str) -> Result<Self> {
        let Some(rest) = raw.strip_prefix(GIT_PREFIX) else {
            bail!("not a git mirror URL: {}", raw);
        };
        let mut url = Url::parse(rest).with_context(|| format!("invalid git URL: {}", raw))?;
        let rev = url
            .fragment()
            .filter(|f| !f.is_empty())
            .map(str::to_string);
        url.set_fragment(None);

        let remote = if url.scheme() == "file" {
            url.to_file_path()
                .map_err(|_| anyhow::anyhow!("invalid file URL: {}", raw))?
                .display()
                .to_string()
        } else {
            url.to_string()
        };
        Ok(GitMirror { remote, rev })
    }

    /// Whether fetching needs the network.
    pub fn is_remote(&self) -> bool {
        !Path::new(&self.remote).is_absolute()
    }

    /// Clone into `dest` (an empty directory), check out the revision and
    /// drop the repository metadata.
    pub fn checkout(&self, dest: &Path) -> Result<()> {
        tracing::info!("Cloning {}", self.remote);
        let repo = Repository::clone(&self.remote, dest)
            .with_context(|| format!("failed to clone {}", self.remote))?;

        {
            let commit = self.find_commit(&repo)?;
            tracing::debug!("Checked out {} at {}", self.remote, commit.id());
            repo.reset(commit.as_object(), ResetType::Hard, None)
                .with_context(|| format!("failed to check out {}", commit.id()))?;
        }
        drop(repo);

        remove_dir_all_if_exists(&dest.join(".git"))
    }

    fn find_commit<'r>(&self, repo: &'r Repository) -> Result<Commit<'r>> {
        let Some(rev) = &self.rev else {
            return repo
                .head()
                .and_then(|head| head.peel_to_commit())
                .context("repository has no HEAD commit");
        };

        // Remote branches only exist as `origin/<name>` after a clone.
        for spec in [rev.clone(), format!("origin/{}", rev)] {
            if let Ok(object) = repo.revparse_single(&spec) {
                return object
                    .peel_to_commit()
                    .with_context(|| format!("`{}` does not name a commit", rev));
            }
        }
        bail!("revision `{}` not found in {}", rev, self.remote)
    }
}
