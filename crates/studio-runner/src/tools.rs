//! Closed tool catalogs per agent role. The runtime dispatches exhaustively
//! over these names; anything else is reported back to the model as unknown.

use crate::gateway::ToolDefinition;
use serde_json::json;

pub const TOOL_BASH: &str = "bash";
pub const TOOL_READ_FILE: &str = "read_file";
pub const TOOL_EDIT_FILE: &str = "edit_file";
pub const TOOL_LIST_DIR: &str = "list_dir";
pub const TOOL_FIND_FILES: &str = "find_files";
pub const TOOL_RUN_TESTS: &str = "run_tests";
pub const TOOL_CREATE_DIFF: &str = "create_diff";
pub const TOOL_SUBMIT_ARTIFACT: &str = "submit_artifact";
pub const TOOL_SUBMIT_PATCH: &str = "submit_patch";

fn bash_tool() -> ToolDefinition {
    ToolDefinition {
        name: TOOL_BASH.to_string(),
        description: "Execute a shell command in the sandbox workspace. \
Output is truncated if too long."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "The command to execute" },
                "timeout": { "type": "integer", "description": "Timeout in seconds (default 300)" },
                "cwd": { "type": "string", "description": "Working directory relative to the workspace" },
            },
            "required": ["command"],
        }),
    }
}

fn read_file_tool() -> ToolDefinition {
    ToolDefinition {
        name: TOOL_READ_FILE.to_string(),
        description: "Read a file, optionally restricted to a 1-indexed line range.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string" },
                "start_line": { "type": "integer" },
                "end_line": { "type": "integer" },
            },
            "required": ["file_path"],
        }),
    }
}

fn edit_file_tool() -> ToolDefinition {
    ToolDefinition {
        name: TOOL_EDIT_FILE.to_string(),
        description: "Edit a file. Operations: full_replace, search_replace, \
insert_at_line, delete_range, apply_unified_diff."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string" },
                "operation": {
                    "type": "string",
                    "enum": [
                        "full_replace",
                        "search_replace",
                        "insert_at_line",
                        "delete_range",
                        "apply_unified_diff"
                    ],
                },
                "content": { "type": "string", "description": "New content (full_replace)" },
                "old_text": { "type": "string", "description": "Text to find (search_replace)" },
                "new_text": { "type": "string", "description": "Replacement text (search_replace)" },
                "line": { "type": "integer", "description": "Insertion line (insert_at_line)" },
                "text": { "type": "string", "description": "Text to insert (insert_at_line)" },
                "start_line": { "type": "integer", "description": "First line to delete (delete_range)" },
                "end_line": { "type": "integer", "description": "Last line to delete (delete_range)" },
                "diff": { "type": "string", "description": "Unified diff (apply_unified_diff)" },
            },
            "required": ["file_path", "operation"],
        }),
    }
}

fn list_dir_tool() -> ToolDefinition {
    ToolDefinition {
        name: TOOL_LIST_DIR.to_string(),
        description: "List the contents of a workspace directory.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory path (default workspace root)" },
            },
            "required": [],
        }),
    }
}

fn find_files_tool() -> ToolDefinition {
    ToolDefinition {
        name: TOOL_FIND_FILES.to_string(),
        description: "Find files matching a glob pattern, e.g. '*.py' or 'test_*.py'.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string" },
                "path": { "type": "string", "description": "Starting directory (default workspace root)" },
            },
            "required": ["pattern"],
        }),
    }
}

fn submit_artifact_tool() -> ToolDefinition {
    ToolDefinition {
        name: TOOL_SUBMIT_ARTIFACT.to_string(),
        description: "Submit the bug artifact for validation. Requires all five \
components: test_script, test_files, test_parser, bug_inject_diff, test_weaken_diff."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "test_script": { "type": "string", "description": "Contents of test_script.sh" },
                "test_files": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Repository-relative test file paths",
                },
                "test_parser": { "type": "string", "description": "Program that maps test output to a JSON status object" },
                "bug_inject_diff": { "type": "string", "description": "Unified diff introducing the bug (code files only)" },
                "test_weaken_diff": { "type": "string", "description": "Unified diff weakening tests (test files only)" },
            },
            "required": [
                "test_script",
                "test_files",
                "test_parser",
                "bug_inject_diff",
                "test_weaken_diff"
            ],
        }),
    }
}

fn run_tests_tool() -> ToolDefinition {
    ToolDefinition {
        name: TOOL_RUN_TESTS.to_string(),
        description: "Run the test harness and report per-test pass/fail counts.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {},
            "required": [],
        }),
    }
}

fn create_diff_tool() -> ToolDefinition {
    ToolDefinition {
        name: TOOL_CREATE_DIFF.to_string(),
        description: "Show a unified diff of every change made so far.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {},
            "required": [],
        }),
    }
}

fn submit_patch_tool() -> ToolDefinition {
    ToolDefinition {
        name: TOOL_SUBMIT_PATCH.to_string(),
        description: "Submit the fix patch. Provide the patch text, a path to a \
patch file, or no arguments to submit the current workspace changes."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "patch": { "type": "string", "description": "Unified diff content" },
                "patch_file": { "type": "string", "description": "Workspace path of a patch file" },
            },
            "required": [],
        }),
    }
}

pub fn injector_tools() -> Vec<ToolDefinition> {
    vec![
        bash_tool(),
        read_file_tool(),
        edit_file_tool(),
        list_dir_tool(),
        find_files_tool(),
        submit_artifact_tool(),
    ]
}

pub fn solver_tools() -> Vec<ToolDefinition> {
    vec![
        bash_tool(),
        read_file_tool(),
        edit_file_tool(),
        list_dir_tool(),
        find_files_tool(),
        run_tests_tool(),
        create_diff_tool(),
        submit_patch_tool(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogs_expose_the_contracted_tool_sets() {
        let injector: Vec<String> = injector_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(
            injector,
            vec![
                "bash",
                "read_file",
                "edit_file",
                "list_dir",
                "find_files",
                "submit_artifact"
            ]
        );
        let solver: Vec<String> = solver_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(
            solver,
            vec![
                "bash",
                "read_file",
                "edit_file",
                "list_dir",
                "find_files",
                "run_tests",
                "create_diff",
                "submit_patch"
            ]
        );
    }

    #[test]
    fn every_tool_parameter_block_is_an_object_schema() {
        for tool in injector_tools().into_iter().chain(solver_tools()) {
            assert_eq!(tool.parameters["type"], "object", "tool {}", tool.name);
            assert!(tool.parameters.get("required").is_some(), "tool {}", tool.name);
        }
    }
}
