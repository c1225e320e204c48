use std::fmt;

const COPY_SUCCESS: &str = "COPY completed";
const APPEND_SUCCESS: &str = "APPEND completed";

/// UIDs in the order they were added.
///
/// Rendered as an explicit list where only strictly consecutive runs are
/// collapsed into `a:b`, so a response never carries an open range like
/// `4:*` or a range reaching past the UIDs actually touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedSeq(Vec<u32>);

impl OrderedSeq {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero is not a UID and is skipped.
    pub fn add(&mut self, uid: u32) {
        if uid != 0 {
            self.0.push(uid);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<u32> for OrderedSeq {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut seq = Self::new();
        for uid in iter {
            seq.add(uid);
        }
        seq
    }
}

impl fmt::Display for OrderedSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut uids = self.0.iter().copied().peekable();
        let mut first = true;

        while let Some(start) = uids.next() {
            let mut end = start;
            while let Some(&next) = uids.peek() {
                if end.checked_add(1) != Some(next) {
                    break;
                }
                end = next;
                uids.next();
            }

            if !first {
                f.write_str(",")?;
            }
            first = false;

            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}:{}", start, end)?;
            }
        }
        Ok(())
    }
}

fn copy_uid(uid_validity: u32, source: &OrderedSeq, target: &OrderedSeq) -> Option<String> {
    if source.is_empty() || target.is_empty() || source.len() != target.len() {
        return None;
    }
    Some(format!("[COPYUID {} {} {}]", uid_validity, source, target))
}

/// Text of the tagged OK for COPY and MOVE.
pub fn copy_response(uid_validity: u32, source: &OrderedSeq, target: &OrderedSeq) -> String {
    match copy_uid(uid_validity, source, target) {
        Some(code) => format!("{} {}", code, COPY_SUCCESS),
        None => COPY_SUCCESS.to_string(),
    }
}

/// Source and target UIDs of a COPY or MOVE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyUids {
    pub uid_validity: u32,
    pub source: OrderedSeq,
    pub target: OrderedSeq,
}

impl CopyUids {
    /// The `[COPYUID ...]` response code, if there is anything to report.
    pub fn code(&self) -> Option<String> {
        copy_uid(self.uid_validity, &self.source, &self.target)
    }

    pub fn response(&self) -> String {
        copy_response(self.uid_validity, &self.source, &self.target)
    }
}

/// Text of the tagged OK for APPEND.
pub fn append_response(uid_validity: u32, target: &OrderedSeq) -> String {
    if target.is_empty() {
        return APPEND_SUCCESS.to_string();
    }
    format!("[APPENDUID {} {}] {}", uid_validity, target, APPEND_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(uids: &[u32]) -> OrderedSeq {
        uids.iter().copied().collect()
    }

    #[test]
    fn test_ordered_seq_rendering() {
        assert_eq!(seq(&[]).to_string(), "");
        assert_eq!(seq(&[1]).to_string(), "1");
        assert_eq!(seq(&[1, 2]).to_string(), "1:2");
        assert_eq!(seq(&[1, 2, 3, 5, 6]).to_string(), "1:3,5:6");
        assert_eq!(seq(&[3, 2, 1]).to_string(), "3,2,1");
        assert_eq!(seq(&[1, 3, 4, 7]).to_string(), "1,3:4,7");
        assert_eq!(seq(&[4, 4]).to_string(), "4,4");
        assert_eq!(seq(&[u32::MAX - 1, u32::MAX]).to_string(), format!("{}:{}", u32::MAX - 1, u32::MAX));
    }

    #[test]
    fn test_zero_is_skipped() {
        let uids = seq(&[0, 5, 0]);
        assert_eq!(uids.len(), 1);
        assert_eq!(uids.to_string(), "5");
    }

    #[test]
    fn test_copy_response() {
        assert_eq!(copy_response(66, &seq(&[1]), &seq(&[1])), "[COPYUID 66 1 1] COPY completed");
        assert_eq!(copy_response(66, &seq(&[4, 5, 6]), &seq(&[1, 2, 3])), "[COPYUID 66 4:6 1:3] COPY completed");
        assert_eq!(copy_response(66, &seq(&[4, 5]), &seq(&[1])), "COPY completed");
        assert_eq!(copy_response(66, &seq(&[]), &seq(&[])), "COPY completed");
    }

    #[test]
    fn test_copy_uids_code() {
        let uids = CopyUids { uid_validity: 9, source: seq(&[3, 7]), target: seq(&[1, 2]) };
        assert_eq!(uids.code().as_deref(), Some("[COPYUID 9 3,7 1:2]"));
        assert_eq!(uids.response(), "[COPYUID 9 3,7 1:2] COPY completed");
        assert_eq!(CopyUids::default().code(), None);
    }

    #[test]
    fn test_append_response() {
        assert_eq!(append_response(7, &seq(&[12])), "[APPENDUID 7 12] APPEND completed");
        assert_eq!(append_response(7, &seq(&[0])), "APPEND completed");
    }
}
