use std::collections::BTreeMap;

/// System prompt for fix generation
pub fn get_system_prompt() -> String {
    include_str!("../prompt.txt").to_string()
}

/// Create the user prompt from the failure output and the referenced files.
pub fn create_user_prompt(
    error_message: &str,
    file_contents: &BTreeMap<String, String>,
    context: Option<&str>,
) -> String {
    let mut user_prompt = String::from(
        "A CI pipeline run failed. Below is the failure output, followed by the current contents of the files it references.\n",
    );

    if let Some(additional) = context.filter(|c| !c.trim().is_empty()) {
        user_prompt.push_str("\nADDITIONAL CONTEXT:\n");
        user_prompt.push_str(additional);
        user_prompt.push('\n');
    }

    user_prompt.push_str("\nERROR OUTPUT BEGINS:\n");
    user_prompt.push_str(error_message);
    user_prompt.push_str("\nERROR OUTPUT ENDS\n");

    if file_contents.is_empty() {
        user_prompt.push_str("\nNo source files were attached.\n");
    } else {
        user_prompt.push_str("\nFILE CONTENTS:\n\n");
        for (file_path, content) in file_contents {
            user_prompt.push_str(&format!("\n === {} ===\n\n{}\n\n", file_path, content));
        }
    }

    user_prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_includes_error_files_and_context() {
        let mut files = BTreeMap::new();
        files.insert("src/lib.rs".to_string(), "pub fn broken() {}".to_string());

        let prompt = create_user_prompt(
            "error[E0425]: cannot find value `x`",
            &files,
            Some("workflow: ci.yml"),
        );

        assert!(prompt.contains("ADDITIONAL CONTEXT:\nworkflow: ci.yml"));
        assert!(prompt.contains("error[E0425]: cannot find value `x`"));
        assert!(prompt.contains(" === src/lib.rs ==="));
        assert!(prompt.contains("pub fn broken() {}"));
    }

    #[test]
    fn test_blank_context_is_omitted() {
        let prompt = create_user_prompt("boom", &BTreeMap::new(), Some("   "));
        assert!(!prompt.contains("ADDITIONAL CONTEXT"));
        assert!(prompt.contains("No source files were attached."));
    }

    #[test]
    fn test_system_prompt_describes_response_shape() {
        let system = get_system_prompt();
        assert!(system.contains("\"rootCause\""));
        assert!(system.contains("\"suggestedFix\""));
        assert!(system.contains("\"confidence\""));
    }
}
