//! Запись локального потока и упаковка результата для сохранения.

use crate::error::{Error, Result};
use crate::media::{LocalMediaStream, MediaFragment, TrackKind};
use crate::utils::lock;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const RECORDING_MIME: &str = "application/gzip";

// Ограничение распаковки, защита от zip-bomb
const MAX_UNPACKED_SIZE: u64 = 512 * 1024 * 1024;

/// Упорядоченный буфер фрагментов, только добавление
#[derive(Debug, Default)]
pub struct RecordingBuffer {
    fragments: Vec<MediaFragment>,
    bytes: usize,
}

impl RecordingBuffer {
    pub fn push(&mut self, fragment: MediaFragment) {
        self.bytes += fragment.data.len();
        self.fragments.push(fragment);
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    fn finalize(self, started_at: DateTime<Utc>) -> Recording {
        Recording {
            started_at,
            finished_at: Utc::now(),
            fragments: self.fragments,
        }
    }
}

/// Законченная запись
#[derive(Debug, Clone)]
pub struct Recording {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fragments: Vec<MediaFragment>,
}

impl Recording {
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn byte_len(&self) -> usize {
        self.fragments.iter().map(|f| f.data.len()).sum()
    }
}

/// Активная запись: по задаче на каждый локальный трек
pub struct Recorder {
    started_at: DateTime<Utc>,
    buffer: Arc<Mutex<RecordingBuffer>>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Recorder {
    /// Подписывается только на локальные треки, удалённые потоки не пишутся
    pub fn start(stream: &LocalMediaStream) -> Self {
        let buffer = Arc::new(Mutex::new(RecordingBuffer::default()));
        let (stop, _) = watch::channel(false);
        let tasks = stream
            .tracks()
            .iter()
            .map(|track| {
                let rx = track.subscribe();
                tokio::spawn(Self::collect(
                    track.id().to_string(),
                    rx,
                    stop.subscribe(),
                    buffer.clone(),
                ))
            })
            .collect();
        info!(stream_id = stream.id(), tracks = stream.tracks().len(), "recording started");
        Self {
            started_at: Utc::now(),
            buffer,
            stop,
            tasks,
        }
    }

    async fn collect(
        track_id: String,
        mut rx: broadcast::Receiver<MediaFragment>,
        mut stop: watch::Receiver<bool>,
        buffer: Arc<Mutex<RecordingBuffer>>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => {
                    // забираем то, что уже успело прийти
                    while let Ok(fragment) = rx.try_recv() {
                        lock(&buffer).push(fragment);
                    }
                    break;
                }
                received = rx.recv() => match received {
                    Ok(fragment) => lock(&buffer).push(fragment),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%track_id, skipped, "recorder lagged, fragments lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!(%track_id, "recorder task finished");
    }

    pub fn fragments(&self) -> usize {
        lock(&self.buffer).len()
    }

    pub async fn stop(self) -> Recording {
        let _ = self.stop.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "recorder task failed");
            }
        }
        let buffer = std::mem::take(&mut *lock(&self.buffer));
        let recording = buffer.finalize(self.started_at);
        info!(
            fragments = recording.len(),
            bytes = recording.byte_len(),
            "recording stopped"
        );
        recording
    }
}

/// Упакованная запись: gzip фрагментов с префиксами длины + SHA-256
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingArtifact {
    pub file_name: String,
    pub mime_type: &'static str,
    pub digest: String,
    pub data: Vec<u8>,
}

impl RecordingArtifact {
    pub fn package(recording: &Recording) -> Result<Self> {
        let mut raw = Vec::with_capacity(recording.byte_len() + recording.len() * 32);
        for fragment in &recording.fragments {
            encode_fragment(&mut raw, fragment)?;
        }

        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(&raw)?;
        let data = gz.finish()?;

        let digest = hex::encode(Sha256::digest(&data));
        let file_name = format!(
            "recording-{}.bin.gz",
            recording.started_at.format("%Y%m%d-%H%M%S")
        );
        debug!(%file_name, raw = raw.len(), packed = data.len(), "recording packaged");
        Ok(Self {
            file_name,
            mime_type: RECORDING_MIME,
            digest,
            data,
        })
    }

    /// Обратная операция к `package`, проверяет дайджест
    pub fn unpack(&self) -> Result<Vec<MediaFragment>> {
        if hex::encode(Sha256::digest(&self.data)) != self.digest {
            return Err(Error::Recording("digest mismatch".into()));
        }
        let mut raw = Vec::new();
        GzDecoder::new(&self.data[..])
            .take(MAX_UNPACKED_SIZE)
            .read_to_end(&mut raw)?;

        let mut cursor = &raw[..];
        let mut fragments = Vec::new();
        while !cursor.is_empty() {
            fragments.push(decode_fragment(&mut cursor)?);
        }
        Ok(fragments)
    }

    /// data: URL для сохранения на стороне клиента
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            general_purpose::STANDARD.encode(&self.data)
        )
    }

    pub async fn save_to(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(&self.file_name);
        tokio::fs::write(&path, &self.data).await?;
        info!(path = %path.display(), bytes = self.data.len(), "recording saved");
        Ok(path)
    }
}

// Формат фрагмента: id_len u16 | id | kind u8 | ts_ms i64 | data_len u32 | data
fn encode_fragment(out: &mut Vec<u8>, fragment: &MediaFragment) -> Result<()> {
    let id = fragment.track_id.as_bytes();
    let id_len = u16::try_from(id.len())
        .map_err(|_| Error::Recording(format!("track id too long: {}", id.len())))?;
    let data_len = u32::try_from(fragment.data.len())
        .map_err(|_| Error::Recording(format!("fragment too large: {}", fragment.data.len())))?;
    out.extend_from_slice(&id_len.to_be_bytes());
    out.extend_from_slice(id);
    out.push(match fragment.kind {
        TrackKind::Audio => 0,
        TrackKind::Video => 1,
    });
    out.extend_from_slice(&fragment.captured_at.timestamp_millis().to_be_bytes());
    out.extend_from_slice(&data_len.to_be_bytes());
    out.extend_from_slice(&fragment.data);
    Ok(())
}

fn take<'a>(cursor: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if cursor.len() < n {
        return Err(Error::Recording("truncated fragment".into()));
    }
    let (head, tail) = cursor.split_at(n);
    *cursor = tail;
    Ok(head)
}

fn decode_fragment(cursor: &mut &[u8]) -> Result<MediaFragment> {
    let mut u16_buf = [0u8; 2];
    u16_buf.copy_from_slice(take(cursor, 2)?);
    let id_len = u16::from_be_bytes(u16_buf) as usize;
    let track_id = String::from_utf8(take(cursor, id_len)?.to_vec())
        .map_err(|e| Error::Recording(e.to_string()))?;
    let kind = match take(cursor, 1)?[0] {
        0 => TrackKind::Audio,
        1 => TrackKind::Video,
        other => return Err(Error::Recording(format!("unknown track kind {other}"))),
    };
    let mut i64_buf = [0u8; 8];
    i64_buf.copy_from_slice(take(cursor, 8)?);
    let captured_at = Utc
        .timestamp_millis_opt(i64::from_be_bytes(i64_buf))
        .single()
        .ok_or_else(|| Error::Recording("bad timestamp".into()))?;
    let mut u32_buf = [0u8; 4];
    u32_buf.copy_from_slice(take(cursor, 4)?);
    let data_len = u32::from_be_bytes(u32_buf) as usize;
    let data = Bytes::copy_from_slice(take(cursor, data_len)?);
    Ok(MediaFragment {
        track_id,
        kind,
        data,
        captured_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaConstraints;
    use std::time::Duration;
    use webrtc::media::Sample;

    fn fragment(track: &str, kind: TrackKind, data: &'static [u8]) -> MediaFragment {
        MediaFragment {
            track_id: track.into(),
            kind,
            data: Bytes::from_static(data),
            // миллисекундная точность, как в формате
            captured_at: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
        }
    }

    fn sample(data: &'static [u8]) -> Sample {
        Sample {
            data: Bytes::from_static(data),
            duration: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn records_only_while_running() {
        let stream = LocalMediaStream::from_constraints("local", &MediaConstraints::audio_only());
        let track = stream.tracks()[0].clone();

        track.write_sample(&sample(b"before")).await.unwrap();
        let recorder = Recorder::start(&stream);
        track.write_sample(&sample(b"one")).await.unwrap();
        track.write_sample(&sample(b"two")).await.unwrap();
        let recording = recorder.stop().await;
        track.write_sample(&sample(b"after")).await.unwrap();

        let data: Vec<_> = recording.fragments.iter().map(|f| f.data.clone()).collect();
        assert_eq!(data, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
        assert!(recording.finished_at >= recording.started_at);
    }

    #[test]
    fn package_unpacks_to_same_fragments() {
        let recording = Recording {
            started_at: Utc.with_ymd_and_hms(2024, 9, 2, 15, 39, 18).unwrap(),
            finished_at: Utc.with_ymd_and_hms(2024, 9, 2, 15, 40, 0).unwrap(),
            fragments: vec![
                fragment("audio-1", TrackKind::Audio, b"opus"),
                fragment("video-1", TrackKind::Video, b"vp8-frame"),
            ],
        };
        let artifact = RecordingArtifact::package(&recording).unwrap();

        assert_eq!(artifact.file_name, "recording-20240902-153918.bin.gz");
        assert_eq!(artifact.digest.len(), 64);
        assert_eq!(artifact.unpack().unwrap(), recording.fragments);
        assert!(artifact
            .to_data_url()
            .starts_with("data:application/gzip;base64,"));
    }

    #[test]
    fn tampered_artifact_is_rejected() {
        let recording = Recording {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            fragments: vec![fragment("a", TrackKind::Audio, b"x")],
        };
        let mut artifact = RecordingArtifact::package(&recording).unwrap();
        let last = artifact.data.len() - 1;
        artifact.data[last] ^= 0xff;
        assert!(matches!(artifact.unpack(), Err(Error::Recording(_))));
    }

    #[tokio::test]
    async fn saves_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let recording = Recording {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            fragments: vec![fragment("a", TrackKind::Audio, b"pcm")],
        };
        let artifact = RecordingArtifact::package(&recording).unwrap();
        let path = artifact.save_to(dir.path().join("out")).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), artifact.data);
    }
}
