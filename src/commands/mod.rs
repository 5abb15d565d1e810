pub mod export;
pub mod report;
pub mod reset_paper;
pub mod run;
pub mod serve;
