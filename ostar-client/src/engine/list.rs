use std::io::Write;

use anyhow::Error;

use super::{drain, Report, RunOptions, Runner};

impl Runner {
    pub(super) fn run_list(&mut self, options: &RunOptions, report: &mut Report) -> Result<(), Error> {
        self.scan_archive(options, report, |runner, _report, header, body| {
            writeln!(runner.stdout, "{}", header.name)?;
            drain(body)
        })
    }
}
