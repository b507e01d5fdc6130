// ===============================
// src/recorder.rs
// ===============================
//
// Jurnal JSONL yang ringan & tahan banting:
// - Tulis setiap Event (quote, keputusan, order, ganti mode) ke file .jsonl (append).
// - Bufer dengan BufWriter agar hemat syscall.
// - Flush periodik tiap 1s dan/atau tiap 200 event.
// - Otomatis membuat parent directory jika belum ada.
// - Jika tulis gagal, coba reopen file dan lanjut; kalau tetap gagal, event di-drop.
//
// ENV: set `RECORD_FILE=/path/to/events.jsonl` agar aktif (lihat main.rs).
//
use std::path::Path;

use serde::Serialize;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::{now_ms, Event};

const FLUSH_EVERY_N_EVENTS: u32 = 200;

#[derive(Serialize)]
struct Line<'a> {
    ts_ms: i64,
    event: &'a Event,
}

async fn open_writer(path: &str) -> std::io::Result<BufWriter<File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<File>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => w,
        Err(e) => {
            error!(?e, %path, "recorder: open failed, journal disabled");
            return;
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    // Channel closed: flush dan keluar
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let line = match serde_json::to_string(&Line { ts_ms: now_ms(), event: &ev }) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };

                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(w) => {
                            writer = w;
                            if let Err(e2) = write_line(&mut writer, &line).await {
                                error!(?e2, "recorder: write failed again after reopen, drop event");
                                continue;
                            }
                        }
                        Err(e2) => {
                            error!(?e2, "recorder: reopen failed, drop event");
                            continue;
                        }
                    }
                }

                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_one_json_line_per_event() {
        let dir = std::env::temp_dir().join(format!("tradebrain-rec-{}", std::process::id()));
        let path = dir.join("events.jsonl").to_string_lossy().to_string();
        let _ = std::fs::remove_file(&path);

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run(rx, path.clone()));
        tx.send(Event::Note("boot".into())).await.unwrap();
        tx.send(Event::Note("tick".into())).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(v["event"]["Note"], "tick");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
