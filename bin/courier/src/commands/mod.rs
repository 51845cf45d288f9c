pub mod check_cmd;
pub mod completions_cmd;
pub mod embedded_skills;
pub mod run_cmd;
