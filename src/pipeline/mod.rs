//! Pipeline stages for exam-paper ingestion.
//!
//! Each submodule implements one step and is testable on its own; the
//! collaborators (PDF source, model, store) are traits so a whole run can be
//! driven by fakes.
//!
//! ## Data Flow
//!
//! ```text
//! input ─▶ render ─▶ partition ─▶ extract ─▶ repair ─▶ shapes ─▶ merge ─▶ validate ─▶ dispatch
//! (URL)   (pdfium)   (ranges)     (model)    (JSON)   (records)  (fold)   (coerce)   (side effects)
//! ```
//!
//! 1. [`input`]     — download the PDF to a temp dir and check its magic bytes
//! 2. [`render`]    — page count, page sizes, rasterise a range (`spawn_blocking`)
//! 3. [`encode`]    — PNG-encode and base64-wrap a rendered page
//! 4. [`partition`] — fixed-size, optionally overlapping page ranges
//! 5. [`extract`]   — one model call per range, retried through [`retry`]
//! 6. [`repair`]    — layered best-effort JSON repair of the reply
//! 7. [`shapes`]    — one adapter per reply shape, all yielding `RawRecord`s
//! 8. [`merge`]     — fold fragments into one record per question number
//! 9. [`validate`]  — coerce merged records into storable items
//! 10. [`dispatch`] — figure crops and answer updates in paced groups

pub mod dispatch;
pub mod encode;
pub mod extract;
pub mod input;
pub mod merge;
pub mod partition;
pub mod render;
pub mod repair;
pub mod retry;
pub mod shapes;
pub mod validate;
