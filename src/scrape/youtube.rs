//! YouTube channel transcript scraper
//!
//! Video lists and metadata come from the Data API v3. Transcripts are read
//! the way a browser gets them: the watch page embeds the available caption
//! tracks, and each track's `baseUrl` serves timedtext XML.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::http::HttpClient;
use crate::scrape::{sanitize_fragment, ScrapeStats};

/// Data API v3 root
const API_BASE: &str = "https://www.googleapis.com/youtube/v3";

/// Watch page root, where caption tracks are discovered
const WATCH_BASE: &str = "https://www.youtube.com/watch";

/// Video ids per videos.list call
const METADATA_CHUNK: usize = 50;

/// Concurrent per-video workers
const MAX_WORKERS: usize = 8;

/// Caption languages in preference order
const TRANSCRIPT_LANGUAGES: &[&str] = &["it", "en"];

lazy_static! {
    static ref CAPTION_TRACKS: Regex =
        Regex::new(r#""captionTracks":(\[.*?\])"#).expect("static regex");
    static ref CUE: Regex = Regex::new(r"(?s)<text[^>]*>(.*?)</text>").expect("static regex");
}

#[derive(Debug, Deserialize)]
struct ApiPage {
    #[serde(default)]
    items: Vec<Value>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CaptionTrack {
    #[serde(rename = "baseUrl")]
    base_url: String,
    #[serde(rename = "languageCode", default)]
    language_code: String,
    #[serde(default)]
    kind: Option<String>,
}

/// Extracted transcript for one video
#[derive(Debug, Clone)]
struct Transcript {
    language: String,
    auto_generated: bool,
    content: String,
    cue_count: usize,
}

/// Scraper for a set of YouTube channels
pub struct YoutubeScraper {
    http: HttpClient,
    api_key: String,
    api_base: String,
    watch_base: String,
    workers: usize,
    /// Data API units spent so far, recorded into each video's metadata
    quota_used: Arc<AtomicU64>,
}

impl YoutubeScraper {
    /// Create a scraper against the production endpoints
    pub fn new(http: HttpClient, api_key: String) -> Self {
        Self::with_endpoints(http, api_key, API_BASE, WATCH_BASE)
    }

    /// Create a scraper against explicit endpoints (tests)
    pub fn with_endpoints(
        http: HttpClient,
        api_key: String,
        api_base: &str,
        watch_base: &str,
    ) -> Self {
        Self {
            http,
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
            watch_base: watch_base.trim_end_matches('/').to_string(),
            workers: MAX_WORKERS,
            quota_used: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Harvest transcripts for every channel in `channels` (id to slug)
    pub async fn run(
        &self,
        channels: &BTreeMap<String, String>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        out_dir: &Path,
    ) -> Result<ScrapeStats> {
        let mut stats = ScrapeStats::default();
        for (channel_id, slug) in channels {
            info!(channel = %slug, "processing channel");
            stats.merge(
                self.download_channel(channel_id, slug, from, to, out_dir)
                    .await?,
            );
        }
        info!(
            downloaded = stats.downloaded,
            skipped = stats.skipped,
            errors = stats.errors,
            api_quota_used = self.quota_used.load(Ordering::Relaxed),
            "YouTube harvest complete"
        );
        Ok(stats)
    }

    async fn download_channel(
        &self,
        channel_id: &str,
        slug: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        out_dir: &Path,
    ) -> Result<ScrapeStats> {
        let Some(uploads_playlist) = self.uploads_playlist(channel_id).await? else {
            warn!(channel = %slug, "channel not found");
            return Ok(ScrapeStats::default());
        };

        let video_ids = self
            .list_video_ids(&uploads_playlist, from, to)
            .await?;
        if video_ids.is_empty() {
            info!(channel = %slug, "no videos in the requested range");
            return Ok(ScrapeStats::default());
        }
        info!(channel = %slug, count = video_ids.len(), "videos to process");

        let videos = self.video_metadata(&video_ids).await?;

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for video in videos {
            let permit_source = Arc::clone(&semaphore);
            let http = self.http.clone();
            let watch_base = self.watch_base.clone();
            let slug = slug.to_string();
            let out_dir = out_dir.to_path_buf();
            let quota = Arc::clone(&self.quota_used);
            tasks.spawn(async move {
                let _permit = permit_source.acquire().await;
                process_video(&http, &watch_base, &video, &slug, &out_dir, &quota).await
            });
        }

        let mut stats = ScrapeStats::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(true)) => stats.downloaded += 1,
                Ok(Ok(false)) => stats.skipped += 1,
                Ok(Err(e)) => {
                    warn!(error = %e, "video processing failed");
                    stats.errors += 1;
                }
                Err(e) => {
                    warn!(error = %e, "video task panicked");
                    stats.errors += 1;
                }
            }
        }

        info!(
            channel = %slug,
            downloaded = stats.downloaded,
            errors = stats.errors,
            "channel complete"
        );
        Ok(stats)
    }

    /// Look up the channel's uploads playlist id
    async fn uploads_playlist(&self, channel_id: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/channels?part=snippet,statistics,contentDetails&id={}&key={}",
            self.api_base, channel_id, self.api_key
        );
        let page = self.api_get(&url).await?;
        let playlist = page.items.first().and_then(|channel| {
            channel
                .pointer("/contentDetails/relatedPlaylists/uploads")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        Ok(playlist)
    }

    /// Walk the uploads playlist, filtering by publish date
    async fn list_video_ids(
        &self,
        playlist_id: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<String>> {
        let mut video_ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/playlistItems?part=snippet&playlistId={}&maxResults=50&key={}",
                self.api_base, playlist_id, self.api_key
            );
            if let Some(token) = &page_token {
                url.push_str("&pageToken=");
                url.push_str(token);
            }

            let page = self.api_get(&url).await?;
            for item in &page.items {
                let Some(video_id) = item
                    .pointer("/snippet/resourceId/videoId")
                    .and_then(Value::as_str)
                else {
                    continue;
                };

                if from.is_some() || to.is_some() {
                    let published = item
                        .pointer("/snippet/publishedAt")
                        .and_then(Value::as_str)
                        .and_then(parse_published);
                    if let Some(published) = published {
                        if from.map_or(false, |f| published < f)
                            || to.map_or(false, |t| published > t)
                        {
                            continue;
                        }
                    }
                }
                video_ids.push(video_id.to_string());
            }

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
            debug!(count = video_ids.len(), "playlist page fetched");
            self.http.polite_delay().await;
        }

        Ok(video_ids)
    }

    /// Fetch full metadata for the videos, in API-sized chunks
    async fn video_metadata(&self, video_ids: &[String]) -> Result<Vec<Value>> {
        let mut all = Vec::with_capacity(video_ids.len());
        for chunk in video_ids.chunks(METADATA_CHUNK) {
            let url = format!(
                "{}/videos?part=snippet,statistics,contentDetails,liveStreamingDetails&id={}&key={}",
                self.api_base,
                chunk.join(","),
                self.api_key
            );
            let page = self.api_get(&url).await?;
            all.extend(page.items);
            self.http.polite_delay().await;
        }
        Ok(all)
    }

    /// GET a Data API URL; quota exhaustion aborts the whole run
    async fn api_get(&self, url: &str) -> Result<ApiPage> {
        let resp = self.http.inner().get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.as_u16() == 403 && body.to_lowercase().contains("quota") {
                return Err(IngestError::QuotaExhausted(format!(
                    "YouTube Data API quota exhausted after {} calls",
                    self.quota_used.load(Ordering::Relaxed)
                )));
            }
            return Err(IngestError::GoogleApi(format!(
                "YouTube API error ({status}): {body}"
            )));
        }
        self.quota_used.fetch_add(1, Ordering::Relaxed);
        Ok(resp.json().await?)
    }
}

/// Process one video: fetch its transcript and write the output pair.
///
/// Returns `Ok(false)` when the video was already on disk.
async fn process_video(
    http: &HttpClient,
    watch_base: &str,
    video: &Value,
    slug: &str,
    out_dir: &Path,
    quota_used: &AtomicU64,
) -> Result<bool> {
    let video_id = video
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| IngestError::scrape("video item without id"))?;
    let title = video
        .pointer("/snippet/title")
        .and_then(Value::as_str)
        .unwrap_or("untitled");
    let published_at = video
        .pointer("/snippet/publishedAt")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| IngestError::scrape(format!("video {video_id} without publish date")))?;

    let is_live = video.get("liveStreamingDetails").is_some();
    let video_type = if is_live { "live_stream" } else { "video" };

    let base_name = format!(
        "{}_{}_{}_{}",
        published_at.format("%Y-%m-%d"),
        video_type,
        sanitize_fragment(title, 50),
        video_id
    );
    let date_dir = out_dir
        .join(slug)
        .join(published_at.year().to_string())
        .join(format!("{:02}", published_at.month()));
    let metadata_path = date_dir.join(format!("{base_name}.json"));

    if metadata_path.exists() {
        debug!(video = video_id, "already downloaded");
        return Ok(false);
    }

    debug!(video = video_id, title, "fetching transcript");
    let transcript = fetch_transcript(http, watch_base, video_id).await;

    let statistics = video.get("statistics").cloned().unwrap_or(json!({}));
    let metadata = json!({
        "video_id": video_id,
        "channel_id": video.pointer("/snippet/channelId").and_then(Value::as_str),
        "channel_slug": slug,
        "title": title,
        "description": video.pointer("/snippet/description").and_then(Value::as_str).unwrap_or(""),
        "published_at": published_at.to_rfc3339(),
        "duration": video.pointer("/contentDetails/duration").and_then(Value::as_str).unwrap_or(""),
        "video_type": video_type,
        "language": video.pointer("/snippet/defaultLanguage").and_then(Value::as_str).unwrap_or("it"),
        "tags": video.pointer("/snippet/tags").cloned().unwrap_or(json!([])),
        "view_count": count_field(&statistics, "viewCount"),
        "like_count": count_field(&statistics, "likeCount"),
        "comment_count": count_field(&statistics, "commentCount"),
        "is_live": is_live,
        "live_details": video.get("liveStreamingDetails").cloned().unwrap_or(json!({})),
        "transcript": transcript_json(&transcript),
        "api_quota_used": quota_used.load(Ordering::Relaxed),
        "source": "youtube",
        "document_type": "video_transcript",
        "date": published_at.date_naive().to_string(),
        "created_at": Utc::now().to_rfc3339(),
    });

    tokio::fs::create_dir_all(&date_dir).await?;
    tokio::fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?).await?;

    if let Ok(transcript) = &transcript {
        let header = format!(
            "# {}\n# Video ID: {}\n# Published: {}\n# Language: {}\n# Type: {}\n\n",
            title,
            video_id,
            published_at.to_rfc3339(),
            transcript.language,
            if transcript.auto_generated {
                "auto_generated"
            } else {
                "manual"
            },
        );
        let transcript_path = date_dir.join(format!("{base_name}.txt"));
        tokio::fs::write(&transcript_path, format!("{header}{}", transcript.content)).await?;
    }

    Ok(true)
}

fn count_field(statistics: &Value, field: &str) -> u64 {
    statistics
        .get(field)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn transcript_json(transcript: &std::result::Result<Transcript, String>) -> Value {
    match transcript {
        Ok(t) => json!({
            "success": true,
            "language": t.language,
            "type": if t.auto_generated { "auto_generated" } else { "manual" },
            "content": t.content,
            "length": t.cue_count,
        }),
        Err(reason) => json!({ "success": false, "error": reason }),
    }
}

/// Fetch a transcript through the watch page caption tracks.
///
/// Failure is a per-video condition, not a run error, so it is reported as
/// a plain string for the metadata record.
async fn fetch_transcript(
    http: &HttpClient,
    watch_base: &str,
    video_id: &str,
) -> std::result::Result<Transcript, String> {
    let watch_url = format!("{watch_base}?v={video_id}");
    let page = match http.get_text(&watch_url).await {
        Ok(Some(body)) => body,
        Ok(None) => return Err("video unavailable".to_string()),
        Err(e) => return Err(format!("watch page fetch failed: {e}")),
    };

    let tracks = parse_caption_tracks(&page);
    let Some(track) = pick_caption_track(&tracks) else {
        return Err("no transcripts available".to_string());
    };

    let xml = match http.get_text(&track.base_url).await {
        Ok(Some(body)) => body,
        Ok(None) => return Err("caption track gone".to_string()),
        Err(e) => return Err(format!("caption fetch failed: {e}")),
    };

    let cues = extract_cues(&xml);
    if cues.is_empty() {
        return Err("empty transcript".to_string());
    }

    Ok(Transcript {
        language: track.language_code.clone(),
        auto_generated: track.kind.as_deref() == Some("asr"),
        cue_count: cues.len(),
        content: cues.join(" "),
    })
}

/// Pull the caption track list out of the watch page player config
fn parse_caption_tracks(page: &str) -> Vec<CaptionTrack> {
    CAPTION_TRACKS
        .captures(page)
        .and_then(|caps| serde_json::from_str(&caps[1]).ok())
        .unwrap_or_default()
}

/// Preferred languages first, manual tracks before auto-generated ones
fn pick_caption_track(tracks: &[CaptionTrack]) -> Option<&CaptionTrack> {
    for lang in TRANSCRIPT_LANGUAGES {
        if let Some(track) = tracks
            .iter()
            .find(|t| t.language_code == *lang && t.kind.as_deref() != Some("asr"))
        {
            return Some(track);
        }
        if let Some(track) = tracks.iter().find(|t| t.language_code == *lang) {
            return Some(track);
        }
    }
    tracks.first()
}

/// Extract cue texts from timedtext XML
fn extract_cues(xml: &str) -> Vec<String> {
    CUE.captures_iter(xml)
        .map(|caps| unescape_entities(caps[1].trim()))
        .filter(|text| !text.is_empty())
        .collect()
}

fn unescape_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&#39;", "'")
        .replace("&quot;", "\"")
}

fn parse_published(raw: &str) -> Option<NaiveDate> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).date_naive())
}
