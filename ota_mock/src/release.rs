// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mock of a GitHub-style release index.
//!
//! Releases are served under `/repos/{owner}/{name}/releases`, their
//! assets under `/download/{tag}/{asset}` and asset uploads are received under
//! `/uploads/repos/{owner}/{name}/releases/{id}/assets`. Every release has id
//! 1; the assets of a release have ids 100, 101 and so on.

use std::rc::Rc;

use httpmock::{
    Method::{DELETE, GET, POST},
    MockRef, MockServer,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// A file attached to a release.
#[derive(Debug, Clone)]
pub struct Asset {
    name: String,
    content: Vec<u8>,
    digest: Option<String>,
}

impl Asset {
    /// An asset without published digest.
    pub fn new(name: &str, content: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            content,
            digest: None,
        }
    }

    /// Publish the real `sha256:` digest of the content.
    pub fn with_digest(self) -> Self {
        let mut asset = self;
        asset.digest = Some(format!("sha256:{}", hex::encode(Sha256::digest(&asset.content))));
        asset
    }

    /// Publish `digest` as is, such as `sha256:<hex>`.
    pub fn digest(self, digest: &str) -> Self {
        let mut asset = self;
        asset.digest = Some(digest.to_string());
        asset
    }

    /// Asset name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A release to publish on the mock.
#[derive(Debug, Clone)]
pub struct Release {
    tag: String,
    body: String,
    assets: Vec<Asset>,
}

impl Release {
    /// A release cut from `tag`, without assets.
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            body: String::new(),
            assets: Vec::new(),
        }
    }

    /// Set the release notes.
    pub fn body(self, body: &str) -> Self {
        let mut release = self;
        release.body = body.to_string();
        release
    }

    /// Attach `asset`.
    pub fn asset(self, asset: Asset) -> Self {
        let mut release = self;
        release.assets.push(asset);
        release
    }

    /// The release tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn json(&self, server: &MockServer, repo: &str) -> Value {
        let assets: Vec<Value> = self
            .assets
            .iter()
            .enumerate()
            .map(|(i, asset)| {
                json!({
                    "id": ASSET_ID_BASE + i as u64,
                    "name": asset.name,
                    "size": asset.content.len(),
                    "digest": asset.digest,
                    "content_type": "application/octet-stream",
                    "download_count": 0,
                    "browser_download_url": server.url(asset_path(&self.tag, &asset.name)),
                })
            })
            .collect();

        json!({
            "id": RELEASE_ID,
            "upload_url": format!("{}{{?name,label}}", server.url(upload_path(repo))),
            "tag_name": self.tag,
            "name": self.tag,
            "body": self.body,
            "draft": false,
            "prerelease": false,
            "html_url": format!("https://github.com/{}/releases/tag/{}", repo, self.tag),
            "published_at": "2021-03-01T12:00:00Z",
            "assets": assets,
        })
    }
}

const RELEASE_ID: u64 = 1;
const ASSET_ID_BASE: u64 = 100;

fn asset_path(tag: &str, name: &str) -> String {
    format!("/download/{}/{}", tag, name)
}

fn upload_path(repo: &str) -> String {
    format!("/uploads/repos/{}/releases/{}/assets", repo, RELEASE_ID)
}

impl Asset {
    fn json(&self, server: &MockServer, tag: &str, id: u64) -> Value {
        json!({
            "id": id,
            "name": self.name,
            "size": self.content.len(),
            "digest": format!("sha256:{}", hex::encode(Sha256::digest(&self.content))),
            "content_type": "application/octet-stream",
            "download_count": 0,
            "browser_download_url": server.url(asset_path(tag, &self.name)),
        })
    }
}

/// Mock release index serving the releases of one repository.
pub struct ReleaseServer {
    /// Repository, such as `acme/firmware`
    pub repo: String,
    token: Option<String>,
    server: Rc<MockServer>,
}

impl ReleaseServer {
    /// Start a release index for `repo`.
    pub fn new(repo: &str) -> Self {
        Self {
            repo: repo.to_string(),
            token: None,
            server: Rc::new(MockServer::start()),
        }
    }

    /// Start a release index whose API requires `token`.
    pub fn private(repo: &str, token: &str) -> Self {
        let mut server = Self::new(repo);
        server.token = Some(token.to_string());
        server
    }

    /// URL of the index API.
    pub fn base_url(&self) -> String {
        self.server.base_url()
    }

    /// Publish `release` as the latest release.
    pub fn add_latest(&self, release: &Release) -> PublishedRelease<'_> {
        let response = release.json(&self.server, &self.repo);
        let latest = self.server.mock(|when, then| {
            let when = when
                .method(GET)
                .path(format!("/repos/{}/releases/latest", self.repo));
            if let Some(token) = &self.token {
                when.header("Authorization", &format!("Bearer {}", token));
            }

            then.status(200)
                .header("Content-Type", "application/json")
                .json_body(response);
        });

        PublishedRelease {
            tag: release.tag.clone(),
            latest,
            assets: self.serve_assets(release),
        }
    }

    /// Publish `release`, reachable by its tag only.
    pub fn add_release(&self, release: &Release) -> PublishedRelease<'_> {
        let response = release.json(&self.server, &self.repo);
        let by_tag = self.server.mock(|when, then| {
            when.method(GET)
                .path(format!("/repos/{}/releases/tags/{}", self.repo, release.tag));

            then.status(200)
                .header("Content-Type", "application/json")
                .json_body(response);
        });

        PublishedRelease {
            tag: release.tag.clone(),
            latest: by_tag,
            assets: self.serve_assets(release),
        }
    }

    /// Answer the release listing with `releases`, newest first.
    pub fn list_releases(&self, releases: &[Release]) -> MockRef<'_> {
        let response: Vec<Value> = releases
            .iter()
            .map(|r| r.json(&self.server, &self.repo))
            .collect();

        self.server.mock(|when, then| {
            when.method(GET)
                .path(format!("/repos/{}/releases", self.repo));

            then.status(200)
                .header("Content-Type", "application/json")
                .json_body(Value::Array(response));
        })
    }

    /// Answer the latest release request with 404, as for a repository
    /// without release.
    pub fn no_release(&self) -> MockRef<'_> {
        self.server.mock(|when, then| {
            when.method(GET)
                .path(format!("/repos/{}/releases/latest", self.repo));

            then.status(404)
                .header("Content-Type", "application/json")
                .json_body(json!({ "message": "Not Found" }));
        })
    }

    /// Expect `asset` to be published under `tag`, a tag without release yet.
    ///
    /// The release is created with `notes` as body. Requests must carry the
    /// token of a [private](ReleaseServer::private) index.
    pub fn expect_new_release(&self, tag: &str, notes: &str, asset: &Asset) -> Publication<'_> {
        let missing = self.server.mock(|when, then| {
            let when = when
                .method(GET)
                .path(format!("/repos/{}/releases/tags/{}", self.repo, tag));
            self.authorized(when);

            then.status(404)
                .header("Content-Type", "application/json")
                .json_body(json!({ "message": "Not Found" }));
        });

        let created = Release::new(tag).body(notes);
        let response = created.json(&self.server, &self.repo);
        let create = self.server.mock(|when, then| {
            let when = when
                .method(POST)
                .path(format!("/repos/{}/releases", self.repo))
                .body_contains(format!("\"tag_name\":\"{}\"", tag))
                .body_contains(format!("\"body\":\"{}\"", notes));
            self.authorized(when);

            then.status(201)
                .header("Content-Type", "application/json")
                .json_body(response);
        });

        Publication {
            lookup: missing,
            create: Some(create),
            delete: None,
            upload: self.expect_upload(tag, asset, ASSET_ID_BASE),
        }
    }

    /// Expect `asset` to be published to the existing `release`, replacing
    /// its asset of the same name.
    pub fn expect_replacement(&self, release: &Release, asset: &Asset) -> Publication<'_> {
        let response = release.json(&self.server, &self.repo);
        let lookup = self.server.mock(|when, then| {
            let when = when
                .method(GET)
                .path(format!("/repos/{}/releases/tags/{}", self.repo, release.tag));
            self.authorized(when);

            then.status(200)
                .header("Content-Type", "application/json")
                .json_body(response);
        });

        let delete = release
            .assets
            .iter()
            .position(|a| a.name == asset.name)
            .map(|i| {
                self.server.mock(|when, then| {
                    let when = when.method(DELETE).path(format!(
                        "/repos/{}/releases/assets/{}",
                        self.repo,
                        ASSET_ID_BASE + i as u64
                    ));
                    self.authorized(when);

                    then.status(204);
                })
            });

        let id = ASSET_ID_BASE + release.assets.len() as u64;
        Publication {
            lookup,
            create: None,
            delete,
            upload: self.expect_upload(&release.tag, asset, id),
        }
    }

    // Asset contents are matched as text
    fn expect_upload(&self, tag: &str, asset: &Asset, id: u64) -> MockRef<'_> {
        let response = asset.json(&self.server, tag, id);
        self.server.mock(|when, then| {
            let when = when
                .method(POST)
                .path(upload_path(&self.repo))
                .query_param("name", &asset.name)
                .header("Content-Type", "application/octet-stream")
                .body(String::from_utf8_lossy(&asset.content).into_owned());
            self.authorized(when);

            then.status(201)
                .header("Content-Type", "application/json")
                .json_body(response);
        })
    }

    fn authorized(&self, when: httpmock::When) -> httpmock::When {
        match &self.token {
            Some(token) => when.header("Authorization", &format!("Bearer {}", token)),
            None => when,
        }
    }

    fn serve_assets(&self, release: &Release) -> Vec<(String, MockRef<'_>)> {
        release
            .assets
            .iter()
            .map(|asset| {
                let mock = self.server.mock(|when, then| {
                    when.method(GET).path(asset_path(&release.tag, &asset.name));

                    then.status(200)
                        .header("Content-Type", "application/octet-stream")
                        .body(&asset.content);
                });
                (asset.name.clone(), mock)
            })
            .collect()
    }
}

/// A release served by [`ReleaseServer`].
pub struct PublishedRelease<'a> {
    /// Release tag
    pub tag: String,
    latest: MockRef<'a>,
    assets: Vec<(String, MockRef<'a>)>,
}

impl<'a> PublishedRelease<'a> {
    /// Number of requests for the release metadata.
    pub fn release_hits(&self) -> usize {
        self.latest.hits()
    }

    /// Number of downloads of the asset called `name`.
    pub fn download_hits(&self, name: &str) -> usize {
        self.assets
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, m)| m.hits())
            .sum()
    }

    /// Number of downloads of all assets.
    pub fn total_download_hits(&self) -> usize {
        self.assets.iter().map(|(_, m)| m.hits()).sum()
    }
}

/// Requests expected while publishing an asset.
pub struct Publication<'a> {
    lookup: MockRef<'a>,
    create: Option<MockRef<'a>>,
    delete: Option<MockRef<'a>>,
    upload: MockRef<'a>,
}

impl<'a> Publication<'a> {
    /// Number of lookups of the release by tag.
    pub fn lookup_hits(&self) -> usize {
        self.lookup.hits()
    }

    /// Number of release creations.
    pub fn create_hits(&self) -> usize {
        self.create.as_ref().map_or(0, |m| m.hits())
    }

    /// Number of deletions of the replaced asset.
    pub fn delete_hits(&self) -> usize {
        self.delete.as_ref().map_or(0, |m| m.hits())
    }

    /// Number of asset uploads.
    pub fn upload_hits(&self) -> usize {
        self.upload.hits()
    }
}
