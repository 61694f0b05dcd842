//! Spaced-repetition rescheduling for markdown task lists.
//! The engine is pure: it turns one completed checklist line into a marked original plus the
//! next open task. The orchestrator and watch modules apply it to whole documents held in a
//! `storage::DocumentStore`.

pub mod core {
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{fmt, io, path::PathBuf, time::Duration};

    /* ------------------------------ Glyphs ------------------------------ */

    /// Due marker written on generated lines.
    pub const DUE_GLYPH: char = '📅';
    /// Alternate due marker, accepted on input and stripped like the canonical one.
    pub const DUE_GLYPH_ALT: char = '📆';
    pub const CREATED_GLYPH: char = '➕';
    pub const DONE_GLYPH: char = '✅';

    /// Appended to a processed line so it never fires again.
    pub const SENTINEL_TAG: &str = "#nextscheduled";
    pub const REPEAT_PREFIX: &str = "#repeat_";

    /* ------------------------------- IDs ------------------------------- */

    /// Identity of a document inside a store (a `/`-separated relative path for files).
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DocId(pub String);

    impl DocId {
        pub fn new(id: impl Into<String>) -> Self {
            Self(id.into())
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl fmt::Display for DocId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl From<&str> for DocId {
        fn from(value: &str) -> Self {
            Self::new(value)
        }
    }

    /* ------------------------------ Ladder ------------------------------ */

    /// Which compiled-in ladder to use.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum LadderKind {
        /// `#revise` .. `#revise_365`, with `#revise_365` repeating yearly.
        #[default]
        Cycle,
        /// `#revise` .. `#revise_90`; the last rung produces no successor.
        Terminating,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Progression {
        pub next_tag: String,
        pub plus_days: u32,
    }

    /// One rung of the ladder. `next == None` marks a terminal rung.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Stage {
        pub next: Option<Progression>,
    }

    /// Ordered mapping from canonical (lower-case) scheduling tag to its stage.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StageTable {
        stages: IndexMap<String, Stage>,
    }

    impl StageTable {
        pub fn empty() -> Self {
            Self {
                stages: IndexMap::new(),
            }
        }

        /// Builder used by the compiled-in ladders and by tests.
        pub fn with_stage(mut self, tag: &str, next: Option<(&str, u32)>) -> Self {
            let next = next.map(|(next_tag, plus_days)| Progression {
                next_tag: next_tag.to_ascii_lowercase(),
                plus_days,
            });
            self.stages.insert(tag.to_ascii_lowercase(), Stage { next });
            self
        }

        pub fn cycle() -> Self {
            Self::empty()
                .with_stage("#revise", Some(("#revise_7", 7)))
                .with_stage("#revise_7", Some(("#revise_30", 30)))
                .with_stage("#revise_30", Some(("#revise_90", 90)))
                .with_stage("#revise_90", Some(("#revise_365", 365)))
                .with_stage("#revise_365", Some(("#revise_365", 365)))
        }

        pub fn terminating() -> Self {
            Self::empty()
                .with_stage("#revise", Some(("#revise_7", 7)))
                .with_stage("#revise_7", Some(("#revise_30", 30)))
                .with_stage("#revise_30", Some(("#revise_90", 90)))
                .with_stage("#revise_90", None)
        }

        pub fn for_kind(kind: LadderKind) -> Self {
            match kind {
                LadderKind::Cycle => Self::cycle(),
                LadderKind::Terminating => Self::terminating(),
            }
        }

        /// Case-insensitive lookup returning the table's own spelling of the tag.
        pub fn canonical_key(&self, tag: &str) -> Option<&str> {
            self.stages
                .get_key_value(tag.to_ascii_lowercase().as_str())
                .map(|(k, _)| k.as_str())
        }

        pub fn get(&self, tag: &str) -> Option<&Stage> {
            self.stages.get(tag.to_ascii_lowercase().as_str())
        }

        pub fn tags(&self) -> impl Iterator<Item = &str> {
            self.stages.keys().map(String::as_str)
        }

        pub fn len(&self) -> usize {
            self.stages.len()
        }

        pub fn is_empty(&self) -> bool {
            self.stages.is_empty()
        }

        /// Every successor must itself be a rung, and every interval positive.
        pub fn validate(&self) -> Result<(), DomainError> {
            for (tag, stage) in &self.stages {
                let Some(next) = &stage.next else { continue };
                if next.plus_days == 0 {
                    return Err(DomainError::ZeroInterval(tag.clone()));
                }
                if !self.stages.contains_key(&next.next_tag) {
                    return Err(DomainError::UnknownNextTag {
                        tag: tag.clone(),
                        next: next.next_tag.clone(),
                    });
                }
            }
            Ok(())
        }
    }

    impl Default for StageTable {
        fn default() -> Self {
            Self::cycle()
        }
    }

    /* --------------------------- Scheduling tags --------------------------- */

    /// A resolved scheduling tag.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum ScheduleTag {
        /// Canonical key of a `StageTable` rung.
        Stage(String),
        /// `#repeat_<N>`: fixed interval of N days, always followed by itself.
        Repeat(u32),
    }

    impl ScheduleTag {
        pub fn render(&self) -> String {
            match self {
                ScheduleTag::Stage(tag) => tag.clone(),
                ScheduleTag::Repeat(days) => format!("{REPEAT_PREFIX}{days}"),
            }
        }
    }

    /// Parse `#repeat_<N>` with N a positive integer. Zero, overflow and non-digits are rejected.
    pub fn parse_repeat(raw: &str) -> Option<u32> {
        let prefix = raw.get(..REPEAT_PREFIX.len())?;
        if !prefix.eq_ignore_ascii_case(REPEAT_PREFIX) {
            return None;
        }
        let digits = &raw[REPEAT_PREFIX.len()..];
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        digits.parse::<u32>().ok().filter(|days| *days > 0)
    }

    /* -------------------------- Checkbox metadata -------------------------- */

    /// Checked state as reported by a host: either a boolean or the raw state character.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum TaskState {
        Flag(bool),
        Code(char),
    }

    impl TaskState {
        pub fn is_checked(self) -> bool {
            match self {
                TaskState::Flag(checked) => checked,
                TaskState::Code(code) => matches!(code, 'x' | 'X'),
            }
        }
    }

    /// One checklist item as located in a document.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StructuralItem {
        pub line: usize,
        pub column: usize,
        pub state: TaskState,
    }

    /// Inbound notification about a document.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum DocEvent {
        /// Document content changed (save hook, filesystem event).
        Changed(DocId),
        /// Host re-reported checklist metadata for the document.
        Checkboxes {
            doc: DocId,
            items: Vec<StructuralItem>,
        },
    }

    impl DocEvent {
        pub fn doc(&self) -> &DocId {
            match self {
                DocEvent::Changed(doc) => doc,
                DocEvent::Checkboxes { doc, .. } => doc,
            }
        }
    }

    /* ------------------------------ Settings ------------------------------ */

    /// How change notifications are turned into rewrite passes.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum TriggerMode {
        /// Rescan the whole document on every change.
        #[default]
        Save,
        /// Diff checkbox state and rewrite only lines that were just checked.
        Toggle,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RunConfig {
        pub ladder: LadderKind,
        pub trigger: TriggerMode,
        /// Quiet period before a burst of change events is processed.
        pub debounce: Duration,
        /// Change events for a document are ignored this long after we wrote it.
        pub self_write_grace: Duration,
        /// Extension (without the dot) of documents considered by bulk scans.
        pub extension: String,
    }

    impl Default for RunConfig {
        fn default() -> Self {
            Self {
                ladder: LadderKind::default(),
                trigger: TriggerMode::default(),
                debounce: Duration::from_millis(300),
                self_write_grace: Duration::from_millis(1000),
                extension: "md".to_string(),
            }
        }
    }

    /* ---------------------------- Errors ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum DomainError {
        #[error("stage {tag} points at {next}, which is not a stage")]
        UnknownNextTag { tag: String, next: String },
        #[error("stage {0} has a zero-day interval")]
        ZeroInterval(String),
    }

    /// Failures at the document I/O boundary. The engine itself never fails.
    #[derive(Debug, thiserror::Error)]
    pub enum RescheduleError {
        #[error("reading {doc}")]
        Read {
            doc: DocId,
            #[source]
            source: io::Error,
        },
        #[error("writing {doc}")]
        Write {
            doc: DocId,
            #[source]
            source: io::Error,
        },
        #[error("listing documents")]
        List {
            #[source]
            source: io::Error,
        },
        #[error("watching {path:?}")]
        Watch {
            path: PathBuf,
            #[source]
            source: notify::Error,
        },
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn compiled_ladders_are_closed() {
            StageTable::cycle().validate().expect("cycle ladder");
            StageTable::terminating()
                .validate()
                .expect("terminating ladder");
        }

        #[test]
        fn validate_rejects_dangling_successor() {
            let table = StageTable::empty().with_stage("#revise", Some(("#revise_7", 7)));
            assert!(matches!(
                table.validate(),
                Err(DomainError::UnknownNextTag { .. })
            ));

            let table = StageTable::empty().with_stage("#revise", Some(("#revise", 0)));
            assert!(matches!(table.validate(), Err(DomainError::ZeroInterval(_))));
        }

        #[test]
        fn canonical_key_ignores_case() {
            let table = StageTable::cycle();
            assert_eq!(table.canonical_key("#ReVise_30"), Some("#revise_30"));
            assert_eq!(table.canonical_key("#revise_31"), None);
            assert_eq!(table.tags().count(), 5);
        }

        #[test]
        fn repeat_tag_requires_positive_count() {
            assert_eq!(parse_repeat("#repeat_3"), Some(3));
            assert_eq!(parse_repeat("#Repeat_014"), Some(14));
            assert_eq!(parse_repeat("#repeat_0"), None);
            assert_eq!(parse_repeat("#repeat_"), None);
            assert_eq!(parse_repeat("#repeat_x"), None);
            assert_eq!(parse_repeat("#repeat_99999999999"), None);
            assert_eq!(parse_repeat("#rep"), None);
        }

        #[test]
        fn task_state_codes() {
            assert!(TaskState::Code('X').is_checked());
            assert!(!TaskState::Code('/').is_checked());
            assert!(TaskState::Flag(true).is_checked());
        }
    }
}

pub mod parser {
    //! Line tokenizer built on `nom`.
    //!
    //! A line is decomposed once into a `TaskLine`: the list lead (indent, marker, gap), the
    //! checkbox state, and the body split into text runs and recognized tokens. Eligibility,
    //! tag resolution and stripping all work on that decomposition.

    use crate::core::*;
    use chrono::NaiveDate;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{take_while_m_n, take_while1},
        character::complete::{char, digit1, one_of, satisfy, space0, space1},
        combinator::{eof, map_res, not, recognize, value},
        error::VerboseError,
        sequence::{delimited, pair, preceded, terminated, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DateKind {
        Due,
        Created,
        Done,
    }

    /// A slice of a task body.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Piece<'a> {
        Text(&'a str),
        /// Any hashtag other than the sentinel, scheduling tags included.
        Hashtag(&'a str),
        Sentinel(&'a str),
        Date {
            kind: DateKind,
            date: NaiveDate,
            raw: &'a str,
        },
    }

    impl<'a> Piece<'a> {
        pub fn raw(&self) -> &'a str {
            match self {
                Piece::Text(raw) | Piece::Hashtag(raw) | Piece::Sentinel(raw) => raw,
                Piece::Date { raw, .. } => raw,
            }
        }
    }

    /// `<lead>[<state>] <pieces...> [^block-id]`
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TaskLine<'a> {
        /// Indent, list marker and the gap before `[`.
        pub lead: &'a str,
        pub state: char,
        pub pieces: Vec<Piece<'a>>,
        pub block_id: Option<&'a str>,
    }

    impl<'a> TaskLine<'a> {
        pub fn is_checked(&self) -> bool {
            matches!(self.state, 'x' | 'X')
        }

        /// Column (in chars) of the opening `[`.
        pub fn checkbox_column(&self) -> usize {
            self.lead.chars().count()
        }

        pub fn has_sentinel(&self) -> bool {
            self.pieces.iter().any(|p| matches!(p, Piece::Sentinel(_)))
        }

        pub fn hashtags(&self) -> impl Iterator<Item = &'a str> {
            self.pieces.iter().filter_map(|p| match p {
                Piece::Hashtag(raw) => Some(*raw),
                _ => None,
            })
        }

        pub fn dates(&self, kind: DateKind) -> impl Iterator<Item = NaiveDate> {
            self.pieces.iter().filter_map(move |p| match p {
                Piece::Date { kind: k, date, .. } if *k == kind => Some(*date),
                _ => None,
            })
        }

        /// The recorded completion date, if any (first one wins).
        pub fn done_date(&self) -> Option<NaiveDate> {
            self.dates(DateKind::Done).next()
        }
    }

    /* ------------------------ Public entry points ------------------------ */

    /// Decompose a checklist line. Returns `None` for anything that is not a checkbox item.
    pub fn parse_task_line(line: &str) -> Option<TaskLine<'_>> {
        let (body, (lead, state)) = task_prefix(line).ok()?;
        let (body, block_id) = split_block_id(body);
        Some(TaskLine {
            lead,
            state,
            pieces: tokenize(body),
            block_id,
        })
    }

    /// True when the text carries the sentinel as a hashtag anywhere.
    pub fn contains_sentinel(text: &str) -> bool {
        tokenize(text)
            .iter()
            .any(|p| matches!(p, Piece::Sentinel(_)))
    }

    /// Byte offset of a trailing `^block-id`, which must be the last token of `s`.
    /// `s` is expected to be trimmed at the end.
    pub fn block_id_start(s: &str) -> Option<usize> {
        let start = s
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace())
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        is_block_id(&s[start..]).then_some(start)
    }

    /* ------------------------------- Utils ------------------------------- */

    fn split_block_id(body: &str) -> (&str, Option<&str>) {
        let trimmed = body.trim_end();
        match block_id_start(trimmed) {
            Some(start) => (trimmed[..start].trim_end(), Some(&trimmed[start..])),
            None => (trimmed, None),
        }
    }

    fn is_block_id(s: &str) -> bool {
        s.strip_prefix('^').is_some_and(|id| {
            !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
    }

    fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || c == '_' || c == '-' || c == '/'
    }

    /* ------------------------------ Prefix ------------------------------ */

    fn task_prefix(i: &str) -> PResult<'_, (&str, char)> {
        let (i, lead) = list_lead(i)?;
        let (i, state) = terminated(checkbox, alt((space1, eof)))(i)?;
        Ok((i, (lead, state)))
    }

    fn list_lead(i: &str) -> PResult<'_, &str> {
        // "- ", "* ", "+ ", "1. ", "2) " with any indent
        recognize(tuple((
            space0,
            alt((
                recognize(one_of("-*+")),
                recognize(pair(digit1, one_of(".)"))),
            )),
            space1,
        )))(i)
    }

    fn checkbox(i: &str) -> PResult<'_, char> {
        delimited(char('['), satisfy(|c| c != '[' && c != ']'), char(']'))(i)
    }

    /* ------------------------------- Body ------------------------------- */

    fn tokenize(body: &str) -> Vec<Piece<'_>> {
        let mut pieces = Vec::new();
        let mut rest = body;
        let mut text_start = 0;
        // Hashtags only start at the beginning or after whitespace.
        let mut at_boundary = true;

        while !rest.is_empty() {
            let offset = body.len() - rest.len();
            let token = (if at_boundary { hashtag(rest).ok() } else { None })
                .or_else(|| date_token(rest).ok());

            if let Some((after, piece)) = token {
                if text_start < offset {
                    pieces.push(Piece::Text(&body[text_start..offset]));
                }
                pieces.push(piece);
                rest = after;
                text_start = body.len() - rest.len();
                at_boundary = false;
                continue;
            }

            let Some(c) = rest.chars().next() else { break };
            at_boundary = c.is_whitespace();
            rest = &rest[c.len_utf8()..];
        }

        if text_start < body.len() {
            pieces.push(Piece::Text(&body[text_start..]));
        }
        pieces
    }

    fn hashtag(i: &str) -> PResult<'_, Piece<'_>> {
        let (rest, raw) = recognize(preceded(char('#'), take_while1(is_tag_char)))(i)?;
        let piece = if raw.eq_ignore_ascii_case(SENTINEL_TAG) {
            Piece::Sentinel(raw)
        } else {
            Piece::Hashtag(raw)
        };
        Ok((rest, piece))
    }

    fn date_token(i: &str) -> PResult<'_, Piece<'_>> {
        let (rest, (kind, _, date)) = tuple((
            alt((
                value(DateKind::Due, char(DUE_GLYPH)),
                value(DateKind::Due, char(DUE_GLYPH_ALT)),
                value(DateKind::Created, char(CREATED_GLYPH)),
                value(DateKind::Done, char(DONE_GLYPH)),
            )),
            space0,
            parse_date,
        ))(i)?;
        let raw = &i[..i.len() - rest.len()];
        Ok((rest, Piece::Date { kind, date, raw }))
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            terminated(
                recognize(tuple((digits(4), char('-'), digits(2), char('-'), digits(2)))),
                not(satisfy(|c| c.is_ascii_digit())),
            ),
            |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d"),
        )(i)
    }

    fn digits<'a>(n: usize) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
        take_while_m_n(n, n, |c: char| c.is_ascii_digit())
    }

}

pub mod format {
    //! Rendering of task lines and tokens.

    use crate::core::{DUE_GLYPH, SENTINEL_TAG};
    use crate::parser::{Piece, block_id_start, contains_sentinel, parse_task_line};
    use chrono::NaiveDate;

    /// Concatenate the kept pieces. Whitespace in front of a dropped piece goes with it.
    pub fn render_body<'a>(
        pieces: &[Piece<'a>],
        mut keep: impl FnMut(&Piece<'a>) -> bool,
    ) -> String {
        let mut out = String::new();
        for piece in pieces {
            if keep(piece) {
                out.push_str(piece.raw());
            } else {
                out.truncate(out.trim_end().len());
            }
        }
        out.trim().to_string()
    }

    pub fn render_task(lead: &str, state: char, body: &str) -> String {
        if body.is_empty() {
            format!("{lead}[{state}]")
        } else {
            format!("{lead}[{state}] {body}")
        }
    }

    /// `line` unchanged if it is an open checkbox item, else re-prefixed with `- [ ] `.
    pub fn ensure_open_task(line: &str) -> String {
        match parse_task_line(line) {
            Some(task) if task.state == ' ' => line.to_string(),
            _ => format!("- [ ] {}", line.trim_start()),
        }
    }

    pub fn due_token(date: NaiveDate) -> String {
        format!("{DUE_GLYPH} {}", date.format("%Y-%m-%d"))
    }

    /// Append the sentinel, keeping a trailing `^block-id` as the last token.
    pub fn mark_processed(line: &str) -> String {
        if contains_sentinel(line) {
            return line.to_string();
        }
        let trimmed = line.trim_end();
        match block_id_start(trimmed) {
            Some(start) => {
                let head = trimmed[..start].trim_end();
                let block_id = &trimmed[start..];
                if head.is_empty() {
                    format!("{SENTINEL_TAG} {block_id}")
                } else {
                    format!("{head} {SENTINEL_TAG} {block_id}")
                }
            }
            None => format!("{trimmed} {SENTINEL_TAG}"),
        }
    }

}

pub mod engine {
    //! The scheduling decision for a single line. Pure: no clock, no I/O, no shared state.

    use crate::core::*;
    use crate::format::{due_token, ensure_open_task, mark_processed, render_body, render_task};
    use crate::parser::{Piece, TaskLine, parse_task_line};
    use chrono::{Days, NaiveDate};
    use serde::Serialize;

    /// Result of a successful evaluation.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct NextTask {
        /// The source line with the sentinel added.
        pub original: String,
        /// The freshly generated open task.
        pub next: String,
        pub due: NaiveDate,
        /// Scheduling tag carried by `next`.
        pub tag: String,
    }

    /// Checked checkbox item not yet processed.
    pub fn is_eligible(task: &TaskLine<'_>) -> bool {
        task.is_checked() && !task.has_sentinel()
    }

    /// Longest stage tag wins; a repeat tag is only consulted when no stage tag is present.
    pub fn resolve_tag(table: &StageTable, task: &TaskLine<'_>) -> Option<ScheduleTag> {
        let mut best: Option<&str> = None;
        for raw in task.hashtags() {
            if let Some(key) = table.canonical_key(raw) {
                if best.is_none_or(|b| key.len() > b.len()) {
                    best = Some(key);
                }
            }
        }
        if let Some(key) = best {
            return Some(ScheduleTag::Stage(key.to_string()));
        }
        task.hashtags()
            .find_map(parse_repeat)
            .map(ScheduleTag::Repeat)
    }

    /// Decide whether `line` fires and, if so, build the (marked original, next task) pair.
    /// `today` is the base date when the line records no completion date.
    pub fn evaluate(table: &StageTable, line: &str, today: NaiveDate) -> Option<NextTask> {
        let task = parse_task_line(line)?;
        if !is_eligible(&task) {
            return None;
        }

        let tag = resolve_tag(table, &task)?;
        let (next_tag, plus_days) = match &tag {
            ScheduleTag::Stage(key) => {
                let progression = table.get(key)?.next.as_ref()?;
                (progression.next_tag.clone(), progression.plus_days)
            }
            ScheduleTag::Repeat(days) => (tag.render(), *days),
        };

        let base = task.done_date().unwrap_or(today);
        let due = base.checked_add_days(Days::new(u64::from(plus_days)))?;

        Some(NextTask {
            original: mark_processed(line),
            next: successor_line(table, &task, due, &next_tag),
            due,
            tag: next_tag,
        })
    }

    fn successor_line(
        table: &StageTable,
        task: &TaskLine<'_>,
        due: NaiveDate,
        next_tag: &str,
    ) -> String {
        let body = render_body(&task.pieces, |p| !is_stale(table, p));
        let line = ensure_open_task(&render_task(task.lead, ' ', &body));
        format!("{line} {} {next_tag}", due_token(due))
    }

    fn is_stale(table: &StageTable, piece: &Piece<'_>) -> bool {
        match piece {
            Piece::Text(_) => false,
            Piece::Sentinel(_) | Piece::Date { .. } => true,
            Piece::Hashtag(raw) => {
                table.canonical_key(raw).is_some() || parse_repeat(raw).is_some()
            }
        }
    }

}

pub mod storage {
    //! Whole-document text storage.

    use crate::core::DocId;
    use async_trait::async_trait;
    use std::{
        collections::BTreeMap,
        io,
        path::{Component, Path, PathBuf},
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    /// Read/write whole documents; writes overwrite.
    #[async_trait]
    pub trait DocumentStore: Send + Sync {
        async fn read(&self, doc: &DocId) -> io::Result<String>;

        async fn write(&self, doc: &DocId, text: &str) -> io::Result<()>;

        /// All documents whose name ends in `.{extension}`, sorted.
        async fn list(&self, extension: &str) -> io::Result<Vec<DocId>>;
    }

    /// Map an absolute path under `root` to its document id.
    pub fn doc_id_for(root: &Path, path: &Path) -> Option<DocId> {
        let rel = path.strip_prefix(root).ok()?;
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?.to_string()),
                _ => return None,
            }
        }
        (!parts.is_empty()).then(|| DocId::new(parts.join("/")))
    }

    pub fn has_extension(path: &Path, extension: &str) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
    }

    /* ----------------------------- Filesystem ----------------------------- */

    /// Documents are files below `root`; hidden entries and symlinks are skipped when listing.
    #[derive(Debug, Clone)]
    pub struct FsDocumentStore {
        root: PathBuf,
    }

    impl FsDocumentStore {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        pub fn path_of(&self, doc: &DocId) -> PathBuf {
            doc.as_str()
                .split('/')
                .fold(self.root.clone(), |path, part| path.join(part))
        }
    }

    #[async_trait]
    impl DocumentStore for FsDocumentStore {
        async fn read(&self, doc: &DocId) -> io::Result<String> {
            tokio::fs::read_to_string(self.path_of(doc)).await
        }

        async fn write(&self, doc: &DocId, text: &str) -> io::Result<()> {
            tokio::fs::write(self.path_of(doc), text.as_bytes()).await
        }

        async fn list(&self, extension: &str) -> io::Result<Vec<DocId>> {
            let mut out = Vec::new();
            let mut pending = vec![self.root.clone()];
            while let Some(dir) = pending.pop() {
                let mut entries = tokio::fs::read_dir(&dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let hidden = entry.file_name().to_string_lossy().starts_with('.');
                    let file_type = entry.file_type().await?;
                    if hidden || file_type.is_symlink() {
                        continue;
                    }
                    let path = entry.path();
                    if file_type.is_dir() {
                        pending.push(path);
                    } else if file_type.is_file() && has_extension(&path, extension) {
                        if let Some(doc) = doc_id_for(&self.root, &path) {
                            out.push(doc);
                        }
                    }
                }
            }
            out.sort();
            Ok(out)
        }
    }

    /* ------------------------------ In memory ------------------------------ */

    /// In-memory store; counts reads and writes so callers can observe what happened.
    #[derive(Debug, Default)]
    pub struct MemoryDocumentStore {
        docs: Mutex<BTreeMap<DocId, String>>,
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    impl MemoryDocumentStore {
        pub fn with_documents<I, K, V>(docs: I) -> Self
        where
            I: IntoIterator<Item = (K, V)>,
            K: Into<DocId>,
            V: Into<String>,
        {
            let store = Self::default();
            for (doc, text) in docs {
                store.insert(doc.into(), text.into());
            }
            store
        }

        pub fn insert(&self, doc: DocId, text: String) {
            self.docs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(doc, text);
        }

        pub fn get(&self, doc: &DocId) -> Option<String> {
            self.docs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(doc)
                .cloned()
        }

        pub fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }

        pub fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DocumentStore for MemoryDocumentStore {
        async fn read(&self, doc: &DocId) -> io::Result<String> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.get(doc).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no document {doc}"))
            })
        }

        async fn write(&self, doc: &DocId, text: &str) -> io::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.insert(doc.clone(), text.to_string());
            Ok(())
        }

        async fn list(&self, extension: &str) -> io::Result<Vec<DocId>> {
            let suffix = format!(".{extension}");
            Ok(self
                .docs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .keys()
                .filter(|doc| doc.as_str().ends_with(&suffix))
                .cloned()
                .collect())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::fs;

        #[test]
        fn doc_ids_are_relative_and_slash_separated() {
            let root = Path::new("/vault");
            assert_eq!(
                doc_id_for(root, Path::new("/vault/daily/2024.md")),
                Some(DocId::new("daily/2024.md"))
            );
            assert_eq!(doc_id_for(root, Path::new("/elsewhere/a.md")), None);
            assert_eq!(doc_id_for(root, root), None);
        }

        #[tokio::test]
        async fn fs_store_lists_matching_files_recursively() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path();
            fs::create_dir_all(root.join("notes/deep")).expect("mkdir");
            fs::create_dir_all(root.join(".obsidian")).expect("mkdir hidden");
            fs::write(root.join("a.md"), "a").expect("write");
            fs::write(root.join("notes/deep/b.MD"), "b").expect("write");
            fs::write(root.join("notes/c.txt"), "c").expect("write");
            fs::write(root.join(".obsidian/d.md"), "d").expect("write");

            let store = FsDocumentStore::new(root);
            let docs = store.list("md").await.expect("list");
            assert_eq!(docs, vec![DocId::new("a.md"), DocId::new("notes/deep/b.MD")]);

            store
                .write(&DocId::new("notes/deep/b.MD"), "changed")
                .await
                .expect("write");
            let text = store.read(&DocId::new("notes/deep/b.MD")).await.expect("read");
            assert_eq!(text, "changed");
        }

        #[tokio::test]
        async fn memory_store_reports_missing_documents() {
            let store = MemoryDocumentStore::with_documents([("a.md", "x")]);
            assert!(store.read(&DocId::new("b.md")).await.is_err());
            assert_eq!(store.reads(), 1);
            assert_eq!(store.list("md").await.expect("list"), vec![DocId::new("a.md")]);
        }
    }
}

pub mod orchestrator {
    //! Applies the engine to whole documents.
    //!
    //! Per-document state (in-flight set, checkbox snapshots, recent self-writes) is owned by
    //! the `Rescheduler` and lives exactly as long as it does. The state mutex is never held
    //! across an `.await`, so guard check-and-set and snapshot updates are atomic with respect
    //! to other tasks.

    use crate::core::*;
    use crate::engine::evaluate;
    use crate::parser::parse_task_line;
    use crate::storage::DocumentStore;
    use chrono::{Local, NaiveDate};
    use serde::Serialize;
    use std::{
        collections::{BTreeMap, BTreeSet, HashMap, HashSet},
        sync::{Arc, Mutex, MutexGuard},
    };
    use tokio::time::Instant;
    use tracing::{debug, error, info, warn};

    /* ------------------------- Injected collaborators ------------------------- */

    pub trait Clock: Send + Sync {
        fn today(&self) -> NaiveDate;
    }

    /// Local wall clock.
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn today(&self) -> NaiveDate {
            Local::now().date_naive()
        }
    }

    pub struct FixedClock(pub NaiveDate);

    impl Clock for FixedClock {
        fn today(&self) -> NaiveDate {
            self.0
        }
    }

    /// User-facing, fire-and-forget notices.
    pub trait Notifier: Send + Sync {
        fn notify(&self, message: &str);
    }

    pub struct StdoutNotifier;

    impl Notifier for StdoutNotifier {
        fn notify(&self, message: &str) {
            println!("{message}");
        }
    }

    /// Keeps notices in memory (tests, embedding hosts that render them later).
    #[derive(Debug, Default)]
    pub struct MemoryNotifier {
        messages: Mutex<Vec<String>>,
    }

    impl MemoryNotifier {
        pub fn messages(&self) -> Vec<String> {
            self.messages
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }
    }

    impl Notifier for MemoryNotifier {
        fn notify(&self, message: &str) {
            self.messages
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(message.to_string());
        }
    }

    /* ------------------------------ Rewriting ------------------------------ */

    /// Which source lines a pass may rewrite.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Scope {
        All,
        Lines(BTreeSet<usize>),
    }

    impl Scope {
        pub fn includes(&self, line: usize) -> bool {
            match self {
                Scope::All => true,
                Scope::Lines(lines) => lines.contains(&line),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Rewrite {
        pub text: String,
        /// Number of successor lines inserted.
        pub scheduled: usize,
    }

    /// `\r\n` if the text uses it anywhere, else `\n`. Terminates an unterminated last line
    /// that gains a successor.
    pub fn line_separator(text: &str) -> &'static str {
        if text.contains("\r\n") { "\r\n" } else { "\n" }
    }

    /// Split on `\n`, pairing each line with its own terminator (`\r\n`, `\n`, or empty for
    /// the last line). A trailing newline yields a final empty line.
    pub fn split_lines(text: &str) -> Vec<(&str, &str)> {
        let mut lines = Vec::new();
        let mut rest = text;
        while let Some(end) = rest.find('\n') {
            let line = &rest[..end];
            match line.strip_suffix('\r') {
                Some(line) => lines.push((line, "\r\n")),
                None => lines.push((line, "\n")),
            }
            rest = &rest[end + 1..];
        }
        lines.push((rest, ""));
        lines
    }

    /// One forward pass: each fired line is replaced by its marked original and followed by
    /// its successor, which takes the source line's terminator. Line indices in `scope` refer
    /// to the input text.
    pub fn rewrite_text(
        table: &StageTable,
        text: &str,
        today: NaiveDate,
        scope: &Scope,
    ) -> Rewrite {
        let fallback = line_separator(text);
        let mut out = String::with_capacity(text.len());
        let mut scheduled = 0;

        for (idx, (line, end)) in split_lines(text).into_iter().enumerate() {
            let fired = if scope.includes(idx) {
                evaluate(table, line, today)
            } else {
                None
            };
            match fired {
                Some(next) => {
                    out.push_str(&next.original);
                    out.push_str(if end.is_empty() { fallback } else { end });
                    out.push_str(&next.next);
                    scheduled += 1;
                }
                None => out.push_str(line),
            }
            out.push_str(end);
        }

        Rewrite {
            text: out,
            scheduled,
        }
    }

    /// Structural checklist items of a document, for hosts that cannot supply them.
    pub fn checkbox_items(text: &str) -> Vec<StructuralItem> {
        split_lines(text)
            .into_iter()
            .enumerate()
            .filter_map(|(line, (raw, _))| {
                parse_task_line(raw).map(|task| StructuralItem {
                    line,
                    column: task.checkbox_column(),
                    state: TaskState::Code(task.state),
                })
            })
            .collect()
    }

    type Snapshot = BTreeMap<(usize, usize), bool>;

    fn snapshot_of(items: &[StructuralItem]) -> Snapshot {
        items
            .iter()
            .map(|item| ((item.line, item.column), item.state.is_checked()))
            .collect()
    }

    /* ------------------------------ Outcomes ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "kebab-case", tag = "outcome")]
    pub enum Outcome {
        /// Another pass over the same document was in flight; this trigger was dropped.
        Busy,
        /// Change event caused by our own write.
        Suppressed,
        Unchanged,
        Rewritten { scheduled: usize },
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
    pub struct ScanSummary {
        pub documents: usize,
        pub changed: usize,
        pub scheduled: usize,
        pub failed: usize,
    }

    /// Work pending for one document: whether its content changed, and the lines host
    /// metadata has already reported as newly checked.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Batch {
        pub doc: DocId,
        pub changed: bool,
        pub flipped: BTreeSet<usize>,
    }

    impl Batch {
        pub fn changed(doc: DocId) -> Self {
            Self {
                doc,
                changed: true,
                flipped: BTreeSet::new(),
            }
        }

        pub fn flipped(doc: DocId, lines: BTreeSet<usize>) -> Self {
            Self {
                doc,
                changed: false,
                flipped: lines,
            }
        }

        /// Fold a later batch for the same document into this one.
        pub fn merge(&mut self, later: Batch) {
            self.changed |= later.changed;
            self.flipped.extend(later.flipped);
        }
    }

    /* ------------------------------ State ------------------------------ */

    #[derive(Debug, Default)]
    struct DocumentStates {
        in_flight: HashSet<DocId>,
        snapshots: HashMap<DocId, Snapshot>,
        self_writes: HashMap<DocId, Instant>,
    }

    /// Held while a document is being processed; releases the document on drop.
    pub struct InFlightGuard<'a> {
        states: &'a Mutex<DocumentStates>,
        doc: DocId,
    }

    impl Drop for InFlightGuard<'_> {
        fn drop(&mut self) {
            self.states
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .in_flight
                .remove(&self.doc);
        }
    }

    /* ------------------------------ Rescheduler ------------------------------ */

    pub struct Rescheduler {
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        table: StageTable,
        config: RunConfig,
        states: Mutex<DocumentStates>,
    }

    impl Rescheduler {
        pub fn new(
            store: Arc<dyn DocumentStore>,
            clock: Arc<dyn Clock>,
            notifier: Arc<dyn Notifier>,
            config: RunConfig,
        ) -> Self {
            Self {
                store,
                clock,
                notifier,
                table: StageTable::for_kind(config.ladder),
                config,
                states: Mutex::new(DocumentStates::default()),
            }
        }

        pub fn config(&self) -> &RunConfig {
            &self.config
        }

        pub fn table(&self) -> &StageTable {
            &self.table
        }

        fn lock(&self) -> MutexGuard<'_, DocumentStates> {
            self.states.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Claim `doc` for processing, or `None` if a pass is already running for it.
        pub fn try_acquire(&self, doc: &DocId) -> Option<InFlightGuard<'_>> {
            let mut states = self.lock();
            if !states.in_flight.insert(doc.clone()) {
                return None;
            }
            Some(InFlightGuard {
                states: &self.states,
                doc: doc.clone(),
            })
        }

        /// Read, rewrite and (when something fired) write back one document.
        pub async fn process_document(
            &self,
            doc: &DocId,
            scope: Scope,
        ) -> Result<Outcome, RescheduleError> {
            let Some(_guard) = self.try_acquire(doc) else {
                debug!(%doc, "already in flight; dropping trigger");
                return Ok(Outcome::Busy);
            };
            let text = self.read(doc).await?;
            self.rewrite_and_store(doc, &text, &scope).await
        }

        /// Toggle-mode pass: diff checkbox state from the current text, then rewrite only the
        /// lines that were just checked, plus any already known to have flipped.
        pub async fn process_toggles(
            &self,
            doc: &DocId,
            mut flipped: BTreeSet<usize>,
        ) -> Result<Outcome, RescheduleError> {
            let Some(_guard) = self.try_acquire(doc) else {
                debug!(%doc, "already in flight; dropping trigger");
                return Ok(Outcome::Busy);
            };
            let text = self.read(doc).await?;
            if let Some(lines) = self.observe_checkboxes(doc, &checkbox_items(&text)) {
                flipped.extend(lines);
            }
            if flipped.is_empty() {
                return Ok(Outcome::Unchanged);
            }
            self.rewrite_and_store(doc, &text, &Scope::Lines(flipped)).await
        }

        async fn read(&self, doc: &DocId) -> Result<String, RescheduleError> {
            self.store
                .read(doc)
                .await
                .map_err(|source| RescheduleError::Read {
                    doc: doc.clone(),
                    source,
                })
        }

        async fn rewrite_and_store(
            &self,
            doc: &DocId,
            text: &str,
            scope: &Scope,
        ) -> Result<Outcome, RescheduleError> {
            let rewrite = rewrite_text(&self.table, text, self.clock.today(), scope);
            if rewrite.scheduled == 0 || rewrite.text == text {
                debug!(%doc, "nothing to schedule");
                return Ok(Outcome::Unchanged);
            }

            self.store
                .write(doc, &rewrite.text)
                .await
                .map_err(|source| RescheduleError::Write {
                    doc: doc.clone(),
                    source,
                })?;
            self.record_write(doc, &rewrite.text);

            info!(%doc, scheduled = rewrite.scheduled, "scheduled next revisions");
            Ok(Outcome::Rewritten {
                scheduled: rewrite.scheduled,
            })
        }

        fn record_write(&self, doc: &DocId, text: &str) {
            let mut states = self.lock();
            states.self_writes.insert(doc.clone(), Instant::now());
            // Inserted lines shift positions; re-baseline so they are not read as toggles.
            if let Some(snapshot) = states.snapshots.get_mut(doc) {
                *snapshot = snapshot_of(&checkbox_items(text));
            }
        }

        /// True while `doc` is inside the grace period after our own write.
        pub fn is_recent_self_write(&self, doc: &DocId) -> bool {
            let grace = self.config.self_write_grace;
            let mut states = self.lock();
            let elapsed = states.self_writes.get(doc).map(|at| at.elapsed());
            match elapsed {
                Some(elapsed) if elapsed < grace => true,
                Some(_) => {
                    states.self_writes.remove(doc);
                    false
                }
                None => false,
            }
        }

        /// Record the current checkbox state and return the lines that flipped from open to
        /// checked. The first sighting of a document only records a baseline.
        pub fn observe_checkboxes(
            &self,
            doc: &DocId,
            items: &[StructuralItem],
        ) -> Option<BTreeSet<usize>> {
            let current = snapshot_of(items);
            let mut states = self.lock();
            let flipped: Option<BTreeSet<usize>> = states.snapshots.get(doc).map(|previous| {
                current
                    .iter()
                    .filter(|(key, checked)| **checked && previous.get(*key) == Some(&false))
                    .map(|((line, _), _)| *line)
                    .collect()
            });
            states.snapshots.insert(doc.clone(), current);

            match flipped {
                None => {
                    debug!(%doc, items = items.len(), "recorded checkbox baseline");
                    None
                }
                Some(lines) if lines.is_empty() => None,
                Some(lines) => {
                    debug!(%doc, ?lines, "checkboxes completed");
                    Some(lines)
                }
            }
        }

        /// Record a snapshot without rewriting anything (document opened).
        pub async fn baseline(&self, doc: &DocId) -> Result<(), RescheduleError> {
            let text = self.read(doc).await?;
            let snapshot = snapshot_of(&checkbox_items(&text));
            self.lock().snapshots.insert(doc.clone(), snapshot);
            Ok(())
        }

        /// Baseline every document in the store; failures are logged and skipped.
        pub async fn baseline_all(&self) -> Result<usize, RescheduleError> {
            let docs = self.list().await?;
            let mut count = 0;
            for doc in &docs {
                match self.baseline(doc).await {
                    Ok(()) => count += 1,
                    Err(err) => warn!(%doc, error = %err, "could not baseline document"),
                }
            }
            Ok(count)
        }

        async fn list(&self) -> Result<Vec<DocId>, RescheduleError> {
            self.store
                .list(&self.config.extension)
                .await
                .map_err(|source| RescheduleError::List { source })
        }

        /// Turn an event into pending work. Checkbox metadata updates the snapshot right away.
        pub fn batch(&self, event: DocEvent) -> Batch {
            match event {
                DocEvent::Changed(doc) => Batch::changed(doc),
                DocEvent::Checkboxes { doc, items } => {
                    let lines = self.observe_checkboxes(&doc, &items).unwrap_or_default();
                    Batch::flipped(doc, lines)
                }
            }
        }

        /// Route one inbound event according to the configured trigger mode.
        pub async fn handle(&self, event: DocEvent) -> Result<Outcome, RescheduleError> {
            self.handle_batch(self.batch(event)).await
        }

        /// Process everything accumulated for one document. A content change in save mode
        /// rescans the whole document, which covers any flipped lines.
        pub async fn handle_batch(&self, batch: Batch) -> Result<Outcome, RescheduleError> {
            let Batch { doc, changed, flipped } = batch;
            if changed {
                if self.is_recent_self_write(&doc) {
                    debug!(%doc, "ignoring change caused by our own write");
                    if flipped.is_empty() {
                        return Ok(Outcome::Suppressed);
                    }
                } else {
                    return match self.config.trigger {
                        TriggerMode::Save => self.process_document(&doc, Scope::All).await,
                        TriggerMode::Toggle => self.process_toggles(&doc, flipped).await,
                    };
                }
            }
            if flipped.is_empty() {
                return Ok(Outcome::Unchanged);
            }
            self.process_document(&doc, Scope::Lines(flipped)).await
        }

        /// Log an I/O failure and tell the user once.
        pub fn report_failure(&self, doc: Option<&DocId>, err: &RescheduleError) {
            error!(error = %err, cause = ?std::error::Error::source(err), "rescheduling failed");
            let message = match doc {
                Some(doc) => format!("Could not schedule revisions in {doc}"),
                None => "Could not schedule revisions".to_string(),
            };
            self.notifier.notify(&message);
        }

        /* ----------------------------- Commands ----------------------------- */

        /// "Scan current document".
        pub async fn scan_current(&self, doc: &DocId) -> Option<Outcome> {
            match self.process_document(doc, Scope::All).await {
                Ok(outcome) => {
                    let message = match outcome {
                        Outcome::Rewritten { scheduled } => {
                            format!("Scheduled {scheduled} revision(s) in {doc}")
                        }
                        Outcome::Busy => format!("{doc} is already being processed"),
                        Outcome::Suppressed | Outcome::Unchanged => {
                            format!("No revisions to schedule in {doc}")
                        }
                    };
                    self.notifier.notify(&message);
                    Some(outcome)
                }
                Err(err) => {
                    self.report_failure(Some(doc), &err);
                    None
                }
            }
        }

        /// "Scan all documents".
        pub async fn scan_all(&self) -> ScanSummary {
            let docs = match self.list().await {
                Ok(docs) => docs,
                Err(err) => {
                    self.report_failure(None, &err);
                    return ScanSummary::default();
                }
            };

            let mut summary = ScanSummary::default();
            for doc in &docs {
                summary.documents += 1;
                match self.process_document(doc, Scope::All).await {
                    Ok(Outcome::Rewritten { scheduled }) => {
                        summary.changed += 1;
                        summary.scheduled += scheduled;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!(%doc, error = %err, "scan failed");
                        summary.failed += 1;
                    }
                }
            }

            self.notifier.notify(&format!(
                "Scheduled {} revision(s) across {} of {} document(s)",
                summary.scheduled, summary.changed, summary.documents
            ));
            if summary.failed > 0 {
                self.notifier.notify(&format!(
                    "Could not process {} document(s); see log",
                    summary.failed
                ));
            }
            summary
        }
    }

}

pub mod watch {
    //! Event pipeline: inbound queue, per-document debounce, dispatch to the `Rescheduler`.
    //!
    //! Bursts of events for one document merge into one batch that is dispatched once the
    //! document has been quiet for the configured period. Checkbox snapshots are applied as
    //! events arrive, so no flip is lost to merging. Dispatch is concurrent across documents;
    //! the rescheduler's in-flight guard keeps it single-flight per document.

    use crate::core::{DocEvent, DocId, RescheduleError};
    use crate::orchestrator::{Batch, Rescheduler};
    use crate::storage::{doc_id_for, has_extension};
    use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
    use std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    };
    use tokio::{
        sync::mpsc,
        task::JoinSet,
        time::{Instant, sleep_until},
    };
    use tracing::{debug, warn};

    /// Pending batches keyed by document; later batches merge in and push the deadline back.
    #[derive(Debug)]
    pub struct Debouncer {
        quiet: Duration,
        pending: HashMap<DocId, (Instant, Batch)>,
    }

    impl Debouncer {
        pub fn new(quiet: Duration) -> Self {
            Self {
                quiet,
                pending: HashMap::new(),
            }
        }

        pub fn push(&mut self, batch: Batch, now: Instant) {
            let deadline = now + self.quiet;
            match self.pending.get_mut(&batch.doc) {
                Some((due, pending)) => {
                    *due = deadline;
                    pending.merge(batch);
                }
                None => {
                    self.pending.insert(batch.doc.clone(), (deadline, batch));
                }
            }
        }

        pub fn next_deadline(&self) -> Option<Instant> {
            self.pending.values().map(|(deadline, _)| *deadline).min()
        }

        pub fn take_due(&mut self, now: Instant) -> Vec<Batch> {
            let due: Vec<DocId> = self
                .pending
                .iter()
                .filter(|(_, (deadline, _))| *deadline <= now)
                .map(|(doc, _)| doc.clone())
                .collect();
            due.into_iter()
                .filter_map(|doc| self.pending.remove(&doc).map(|(_, batch)| batch))
                .collect()
        }

        pub fn drain(&mut self) -> Vec<Batch> {
            self.pending.drain().map(|(_, (_, batch))| batch).collect()
        }

        pub fn is_empty(&self) -> bool {
            self.pending.is_empty()
        }
    }

    /// Consume events until the sender side closes, then flush what is pending and wait for
    /// in-flight work.
    pub async fn run(
        rescheduler: Arc<Rescheduler>,
        mut events: mpsc::UnboundedReceiver<DocEvent>,
        quiet: Duration,
    ) {
        let mut debouncer = Debouncer::new(quiet);
        let mut tasks = JoinSet::new();

        loop {
            let deadline = debouncer.next_deadline();
            tokio::select! {
                received = events.recv() => match received {
                    Some(event) => {
                        debug!(doc = %event.doc(), "change queued");
                        debouncer.push(rescheduler.batch(event), Instant::now());
                    }
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    for batch in debouncer.take_due(Instant::now()) {
                        dispatch(&mut tasks, &rescheduler, batch);
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "document task panicked");
                    }
                }
            }
        }

        for batch in debouncer.drain() {
            dispatch(&mut tasks, &rescheduler, batch);
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "document task panicked");
            }
        }
    }

    fn dispatch(tasks: &mut JoinSet<()>, rescheduler: &Arc<Rescheduler>, batch: Batch) {
        let rescheduler = Arc::clone(rescheduler);
        tasks.spawn(async move {
            let doc = batch.doc.clone();
            match rescheduler.handle_batch(batch).await {
                Ok(outcome) => debug!(%doc, ?outcome, "change handled"),
                Err(err) => rescheduler.report_failure(Some(&doc), &err),
            }
        });
    }

    /* --------------------------- Filesystem bridge --------------------------- */

    /// Keeps the file watcher alive; dropping it stops events (and closes its sender).
    pub struct DirectoryWatcher {
        _watcher: RecommendedWatcher,
    }

    /// Forward modify/create events for `*.{extension}` files under `root` as
    /// `DocEvent::Changed`. `root` should be canonical so event paths map back to ids.
    pub fn watch_directory(
        root: &Path,
        extension: &str,
        events: mpsc::UnboundedSender<DocEvent>,
    ) -> Result<DirectoryWatcher, RescheduleError> {
        let watch_err = |source| RescheduleError::Watch {
            path: root.to_path_buf(),
            source,
        };
        let base: PathBuf = root.to_path_buf();
        let extension = extension.to_string();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                            return;
                        }
                        for path in &event.paths {
                            if !has_extension(path, &extension) {
                                continue;
                            }
                            if let Some(doc) = doc_id_for(&base, path) {
                                let _ = events.send(DocEvent::Changed(doc));
                            }
                        }
                    }
                    Err(err) => warn!(error = %err, "file watch error"),
                }
            })
            .map_err(watch_err)?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(watch_err)?;
        Ok(DirectoryWatcher { _watcher: watcher })
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{RunConfig, StructuralItem, TaskState};
        use crate::orchestrator::{FixedClock, MemoryNotifier};
        use std::collections::BTreeSet;
        use crate::storage::MemoryDocumentStore;
        use chrono::NaiveDate;

        fn rescheduler(store: Arc<MemoryDocumentStore>) -> Arc<Rescheduler> {
            Arc::new(Rescheduler::new(
                store,
                Arc::new(FixedClock(NaiveDate::from_ymd_opt(2023, 2, 1).unwrap())),
                Arc::new(MemoryNotifier::default()),
                RunConfig::default(),
            ))
        }

        #[tokio::test]
        async fn debouncer_merges_batches_per_document() {
            let quiet = Duration::from_millis(300);
            let mut d = Debouncer::new(quiet);
            let t0 = Instant::now();
            let a = DocId::new("a.md");

            d.push(Batch::changed(a.clone()), t0);
            d.push(
                Batch::flipped(a.clone(), BTreeSet::from([3])),
                t0 + Duration::from_millis(100),
            );
            d.push(Batch::changed(DocId::new("b.md")), t0 + Duration::from_millis(50));

            assert_eq!(d.next_deadline(), Some(t0 + Duration::from_millis(350)));
            assert!(d.take_due(t0 + Duration::from_millis(349)).is_empty());
            assert_eq!(
                d.take_due(t0 + Duration::from_millis(350)),
                vec![Batch::changed(DocId::new("b.md"))]
            );
            assert_eq!(
                d.take_due(t0 + Duration::from_millis(400)),
                vec![Batch {
                    doc: a,
                    changed: true,
                    flipped: BTreeSet::from([3]),
                }]
            );
            assert!(d.is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn checkbox_metadata_does_not_hide_a_content_change() {
            let store = Arc::new(MemoryDocumentStore::with_documents([(
                "a.md",
                "- [x] T #repeat_7\n",
            )]));
            let (tx, rx) = mpsc::unbounded_channel();
            let quiet = Duration::from_millis(300);
            let worker = tokio::spawn(run(rescheduler(store.clone()), rx, quiet));

            tx.send(DocEvent::Changed(DocId::new("a.md"))).expect("send");
            tx.send(DocEvent::Checkboxes {
                doc: DocId::new("a.md"),
                items: vec![StructuralItem {
                    line: 0,
                    column: 2,
                    state: TaskState::Flag(true),
                }],
            })
            .expect("send");
            tokio::time::sleep(quiet * 2).await;

            assert_eq!(store.writes(), 1);
            assert_eq!(
                store.get(&DocId::new("a.md")).as_deref(),
                Some("- [x] T #repeat_7 #nextscheduled\n- [ ] T 📅 2023-02-08 #repeat_7\n")
            );

            drop(tx);
            worker.await.expect("worker");
        }

        #[tokio::test(start_paused = true)]
        async fn flips_reported_before_a_merge_are_kept() {
            let store = Arc::new(MemoryDocumentStore::with_documents([(
                "h.md",
                "- [x] A #repeat_1\n- [x] B #repeat_1\n",
            )]));
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = tokio::spawn(run(rescheduler(store.clone()), rx, Duration::from_millis(300)));
            let items = |a, b| {
                vec![
                    StructuralItem { line: 0, column: 2, state: TaskState::Flag(a) },
                    StructuralItem { line: 1, column: 2, state: TaskState::Flag(b) },
                ]
            };
            let doc = DocId::new("h.md");

            // Baseline, then a flip of line 1, then an unrelated update, all in one window.
            tx.send(DocEvent::Checkboxes { doc: doc.clone(), items: items(true, false) }).expect("send");
            tx.send(DocEvent::Checkboxes { doc: doc.clone(), items: items(true, true) }).expect("send");
            tx.send(DocEvent::Checkboxes { doc: doc.clone(), items: items(true, true) }).expect("send");
            drop(tx);
            worker.await.expect("worker");

            assert_eq!(store.writes(), 1);
            let written = store.get(&doc).expect("doc");
            assert!(written.starts_with("- [x] A #repeat_1\n- [x] B #repeat_1 #nextscheduled\n"));
        }

        #[tokio::test(start_paused = true)]
        async fn burst_collapses_into_one_pass() {
            let store = Arc::new(MemoryDocumentStore::with_documents([(
                "a.md",
                "- [x] Task 2 #repeat_7\n",
            )]));
            let (tx, rx) = mpsc::unbounded_channel();
            let quiet = Duration::from_millis(300);
            let worker = tokio::spawn(run(rescheduler(store.clone()), rx, quiet));

            for _ in 0..5 {
                tx.send(DocEvent::Changed(DocId::new("a.md"))).expect("send");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            tokio::time::sleep(quiet * 2).await;
            assert_eq!(store.reads(), 1);
            assert_eq!(
                store.get(&DocId::new("a.md")).as_deref(),
                Some("- [x] Task 2 #repeat_7 #nextscheduled\n- [ ] Task 2 📅 2023-02-08 #repeat_7\n")
            );

            drop(tx);
            worker.await.expect("worker");
        }

        #[tokio::test(start_paused = true)]
        async fn closing_the_queue_flushes_pending_events() {
            let store = Arc::new(MemoryDocumentStore::with_documents([
                ("a.md", "- [x] A #revise ✅ 2023-01-01\n"),
                ("b.md", "- [x] B #repeat_2 ✅ 2023-01-01\n"),
            ]));
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = tokio::spawn(run(rescheduler(store.clone()), rx, Duration::from_secs(60)));

            tx.send(DocEvent::Changed(DocId::new("a.md"))).expect("send");
            tx.send(DocEvent::Changed(DocId::new("b.md"))).expect("send");
            drop(tx);
            worker.await.expect("worker");

            assert_eq!(store.writes(), 2);
            assert!(store.get(&DocId::new("a.md")).expect("a").contains("#revise_7"));
            assert!(store.get(&DocId::new("b.md")).expect("b").contains("📅 2023-01-03 #repeat_2"));
        }
    }
}

pub use engine::{NextTask, evaluate};
pub use orchestrator::{Outcome, Rescheduler, Scope, rewrite_text};
pub use parser::parse_task_line;
