use std::io;
use std::path::{Path, PathBuf};

use crate::call::CallMetadata;
use crate::pipeline::brain::Conversation;

/// Write the call transcript to `dir` (created on demand). Returns the path
/// of the file written.
pub fn save(
    conversation: &Conversation,
    metadata: &CallMetadata,
    dir: &Path,
) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let timestamp = metadata.start_time.format("%Y%m%d_%H%M%S");
    let sid = metadata
        .call_sid
        .get(..8)
        .unwrap_or(metadata.call_sid.as_str());
    let path = dir.join(format!("call_{timestamp}_{sid}.txt"));

    let content = format!(
        "Call Transcript\n\
         ===============\n\
         Time: {}\n\
         Caller: {}\n\
         Call SID: {}\n\
         \n\
         Conversation:\n\
         -------------\n\
         {}\n",
        metadata.start_time.to_rfc3339(),
        metadata.caller,
        metadata.call_sid,
        conversation.transcript(),
    );

    std::fs::write(&path, content)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    #[test]
    fn writes_labeled_transcript_with_header() {
        let mut conversation = Conversation::new("prompt".into());
        conversation.add_assistant_message("Hello, this is AI Assistant. How can I help you?");
        conversation.add_user_message("what time do you open");
        conversation.add_assistant_message("We open at nine.");

        let metadata = CallMetadata {
            call_sid: "CA1234567890".into(),
            stream_sid: "MZ456".into(),
            caller: "+15551234567".into(),
            called: "+15559876543".into(),
            start_time: Local::now(),
        };

        let dir = tempfile::tempdir().expect("tempdir");
        let path = save(&conversation, &metadata, dir.path()).expect("save");

        let name = path.file_name().and_then(|n| n.to_str()).expect("filename");
        assert!(name.starts_with("call_"), "unexpected name: {name}");
        assert!(name.ends_with("_CA123456.txt"), "unexpected name: {name}");

        let content = std::fs::read_to_string(&path).expect("read back");
        assert!(content.contains("Caller: +15551234567"));
        assert!(content.contains("Call SID: CA1234567890"));
        assert!(content.contains("Caller: what time do you open"));
        assert!(content.contains("Assistant: We open at nine."));
    }

    #[test]
    fn short_call_sid_is_used_whole() {
        let conversation = {
            let mut c = Conversation::new("prompt".into());
            c.add_user_message("hi");
            c
        };
        let metadata = CallMetadata {
            call_sid: "CA1".into(),
            stream_sid: String::new(),
            caller: "Unknown".into(),
            called: String::new(),
            start_time: Local::now(),
        };

        let dir = tempfile::tempdir().expect("tempdir");
        let path = save(&conversation, &metadata, dir.path()).expect("save");
        let name = path.file_name().and_then(|n| n.to_str()).expect("filename");
        assert!(name.ends_with("_CA1.txt"), "unexpected name: {name}");
    }
}
