//! Text messages describing results, for controllers on a serial link

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::coords::StdCoords;
use crate::dnn::postprocess::{ObjDetect, ObjReco, Results};
use crate::error::Result;

/// Amount of detail per message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerStyle {
    /// Position or best label only
    Terse,
    /// Label, center and size
    #[default]
    Normal,
    /// Label and the four corners
    Detail,
    /// Label, vertex count and vertices
    Fine,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub enabled: bool,
    pub style: SerStyle,
    /// Decimals in coordinates and scores
    pub prec: usize,
    /// Messages buffered before new ones are dropped
    pub queue: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            style: SerStyle::Normal,
            prec: 0,
            queue: 64,
        }
    }
}

const DROP_REPORT_PERIOD: Duration = Duration::from_secs(1);

/// Bounded message queue in front of a slow link. Never blocks: a full
/// queue drops the message and reports drops at most once per second.
pub struct SerialQueue {
    tx: flume::Sender<String>,
    dropped: AtomicU64,
    last_report: Mutex<Option<Instant>>,
}

impl SerialQueue {
    pub fn new(capacity: usize) -> (Self, flume::Receiver<String>) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        let queue = Self {
            tx,
            dropped: AtomicU64::new(0),
            last_report: Mutex::new(None),
        };
        (queue, rx)
    }

    /// Queues `msg`; returns false when it was dropped.
    pub fn send(&self, msg: String) -> bool {
        if self.tx.try_send(msg).is_ok() {
            return true;
        }
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::counter!("serial_dropped").increment(1);

        let mut last = self.last_report.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if last.map_or(true, |t| now.duration_since(t) >= DROP_REPORT_PERIOD) {
            *last = Some(now);
            error!("Serial queue full or closed, {total} messages dropped so far");
        }
        false
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join("_")
}

/// Formats results per [`SerStyle`] and queues the messages.
pub struct SerialReporter {
    style: SerStyle,
    prec: usize,
    queue: SerialQueue,
}

impl SerialReporter {
    pub fn new(style: SerStyle, prec: usize, queue: SerialQueue) -> Self {
        Self { style, prec, queue }
    }

    pub fn queue(&self) -> &SerialQueue {
        &self.queue
    }

    fn emit(&self, msg: String) -> String {
        self.queue.send(msg.clone());
        msg
    }

    fn id(id: &str) -> String {
        if id.is_empty() {
            "unknown".into()
        } else {
            ws(id)
        }
    }

    /// 2D object in standardized coordinates, centered at (x, y)
    pub fn std2d(&self, x: f32, y: f32, w: f32, h: f32, id: &str, extra: &str) -> String {
        let p = self.prec;
        let mut m = String::new();
        let corners = [
            (x - 0.5 * w, y - 0.5 * h),
            (x + 0.5 * w, y - 0.5 * h),
            (x + 0.5 * w, y + 0.5 * h),
            (x - 0.5 * w, y + 0.5 * h),
        ];
        // Writing to a String cannot fail
        let _ = match self.style {
            SerStyle::Terse => write!(m, "T2 {x:.p$} {y:.p$}"),
            SerStyle::Normal => write!(m, "N2 {} {x:.p$} {y:.p$} {w:.p$} {h:.p$}", Self::id(id)),
            SerStyle::Detail | SerStyle::Fine => {
                let _ = match self.style {
                    SerStyle::Fine => write!(m, "F2 {} {}", Self::id(id), corners.len()),
                    _ => write!(m, "D2 {}", Self::id(id)),
                };
                for (cx, cy) in corners {
                    let _ = write!(m, " {cx:.p$} {cy:.p$}");
                }
                if extra.is_empty() {
                    Ok(())
                } else {
                    write!(m, " {extra}")
                }
            }
        };
        self.emit(m)
    }

    /// 2D object in pixels of a `camw`x`camh` image
    #[allow(clippy::too_many_arguments)]
    pub fn img2d(&self, camw: u32, camh: u32, x: f32, y: f32, w: f32, h: f32, id: &str, extra: &str) -> Result<String> {
        let c = StdCoords::new(camw, camh)?;
        let (sx, sy) = c.img_to_std(x, y);
        let (sw, sh) = c.img_to_std_size(w, h);
        Ok(self.std2d(sx, sy, sw, sh, id, extra))
    }

    /// Best recognitions of a whole frame. Nothing is sent for an empty list.
    pub fn obj_reco(&self, res: &[ObjReco]) -> Option<String> {
        let first = res.first()?;
        let p = self.prec;
        let mut m = String::new();
        let _ = match self.style {
            SerStyle::Terse => write!(m, "TO {}", ws(&first.category)),
            SerStyle::Normal => write!(m, "NO {}:{:.p$}", ws(&first.category), first.score),
            SerStyle::Detail | SerStyle::Fine => {
                m.push_str(if self.style == SerStyle::Detail { "DO" } else { "FO" });
                for r in res {
                    let _ = write!(m, " {}:{:.p$}", ws(&r.category), r.score);
                }
                Ok(())
            }
        };
        Some(self.emit(m))
    }

    /// One detection box. The best label is the id; in the detailed styles
    /// the runner-up labels follow as extra text.
    pub fn obj_det_img2d(&self, camw: u32, camh: u32, det: &ObjDetect) -> Result<Option<String>> {
        let Some(first) = det.reco.first() else {
            return Ok(None);
        };
        let p = self.prec;
        let label = |r: &ObjReco| match self.style {
            SerStyle::Terse => ws(&r.category),
            _ => format!("{}:{:.p$}", ws(&r.category), r.score),
        };
        let best = label(first);
        let extra = det.reco[1..].iter().map(label).collect::<Vec<_>>().join(" ");
        let (w, h) = (det.brx - det.tlx, det.bry - det.tly);
        let msg = self.img2d(camw, camh, det.tlx + 0.5 * w, det.tly + 0.5 * h, w, h, &best, &extra)?;
        Ok(Some(msg))
    }

    /// Reports whatever a post-processor produced for one frame.
    pub fn report(&self, results: Results<'_>, camw: u32, camh: u32) -> Result<usize> {
        Ok(match results {
            Results::Recognitions(r) => self.obj_reco(r).map_or(0, |_| 1),
            Results::Detections(dets) => {
                let mut n = 0;
                for d in dets {
                    if self.obj_det_img2d(camw, camh, d)?.is_some() {
                        n += 1;
                    }
                }
                n
            }
            Results::Overlay(_) => 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter(style: SerStyle, prec: usize) -> (SerialReporter, flume::Receiver<String>) {
        let (q, rx) = SerialQueue::new(16);
        (SerialReporter::new(style, prec, q), rx)
    }

    fn reco(category: &str, score: f32) -> ObjReco {
        ObjReco {
            score,
            category: category.into(),
        }
    }

    #[test]
    fn std2d_styles() {
        let (r, _rx) = reporter(SerStyle::Terse, 0);
        assert_eq!(r.std2d(10.0, -20.0, 100.0, 50.0, "x", ""), "T2 10 -20");
        let (r, _rx) = reporter(SerStyle::Normal, 1);
        assert_eq!(r.std2d(10.0, -20.0, 100.0, 50.0, "", ""), "N2 unknown 10.0 -20.0 100.0 50.0");
        let (r, _rx) = reporter(SerStyle::Detail, 0);
        assert_eq!(
            r.std2d(0.0, 0.0, 100.0, 50.0, "big cat", "more"),
            "D2 big_cat -50 -25 50 -25 50 25 -50 25 more"
        );
        let (r, _rx) = reporter(SerStyle::Fine, 0);
        assert_eq!(r.std2d(0.0, 0.0, 2.0, 2.0, "a", ""), "F2 a 4 -1 -1 1 -1 1 1 -1 1");
    }

    #[test]
    fn recognitions_and_detections() {
        let (r, rx) = reporter(SerStyle::Normal, 1);
        let res = vec![reco("tabby cat", 91.3), reco("dog", 5.0)];
        assert_eq!(r.obj_reco(&res).unwrap(), "NO tabby_cat:91.3");
        assert!(r.obj_reco(&[]).is_none());

        let det = ObjDetect {
            tlx: 0.0,
            tly: 0.0,
            brx: 320.0,
            bry: 240.0,
            reco: res.clone(),
        };
        let msg = r.obj_det_img2d(640, 480, &det).unwrap().unwrap();
        assert_eq!(msg, "N2 tabby_cat:91.3 -500.0 -375.0 1000.0 750.0");
        assert_eq!(rx.try_iter().count(), 2);

        let (r, _rx) = reporter(SerStyle::Detail, 0);
        let n = r.report(Results::Recognitions(&res), 640, 480).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (q, rx) = SerialQueue::new(2);
        assert!(q.send("a".into()));
        assert!(q.send("b".into()));
        assert!(!q.send("c".into()));
        assert!(!q.send("d".into()));
        assert_eq!(q.dropped(), 2);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(q.send("e".into()));
    }
}
