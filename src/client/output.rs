use cli_table::format::{Justify, Separator};
use cli_table::{print_stdout, Cell, CellStruct, Color, ColorChoice, Style, Table, TableStruct};
use colored::Colorize;
use std::io::IsTerminal;

use crate::common::format::{format_ts, human_mem_mb};
use crate::store::{Job, JobStatus, StoreStats};

pub const STATUS_COLOR_PENDING: Color = Color::Cyan;
pub const STATUS_COLOR_RUNNING: Color = Color::Yellow;
pub const STATUS_COLOR_COMPLETED: Color = Color::Green;
pub const STATUS_COLOR_FAILED: Color = Color::Red;
pub const STATUS_COLOR_CANCELLED: Color = Color::Magenta;

/// Live host readings shown by `stats` when psutil can provide them.
#[derive(Debug, Default)]
pub struct SystemInfo {
    pub cpu_percent: Option<f32>,
    pub mem_percent: Option<f32>,
}

pub struct CliOutput {
    color_policy: ColorChoice,
}

impl Default for CliOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl CliOutput {
    pub fn new() -> CliOutput {
        let color_policy = if std::io::stdout().is_terminal() {
            ColorChoice::Auto
        } else {
            ColorChoice::Never
        };
        CliOutput { color_policy }
    }

    fn print_vertical_table(&self, rows: Vec<Vec<CellStruct>>) {
        let table = rows.table().separator(
            Separator::builder()
                .column(Some(Default::default()))
                .build(),
        );
        self.print_table(table);
    }

    fn print_horizontal_table(&self, rows: Vec<Vec<CellStruct>>, header: Vec<CellStruct>) {
        let table = rows
            .table()
            .separator(
                Separator::builder()
                    .title(Some(Default::default()))
                    .column(Some(Default::default()))
                    .build(),
            )
            .title(header);
        self.print_table(table);
    }

    fn print_table(&self, table: TableStruct) {
        let table = table.color_choice(self.color_policy);
        if let Err(e) = print_stdout(table) {
            log::error!("Cannot print table to stdout: {e:?}");
        }
    }

    pub fn print_job_list(&self, jobs: &[Job]) {
        let rows: Vec<Vec<CellStruct>> = jobs
            .iter()
            .map(|job| {
                vec![
                    job.id.cell().justify(Justify::Right),
                    status_cell(job.status),
                    job.cpus.cell().justify(Justify::Right),
                    job.mem_mb.cell().justify(Justify::Right),
                    job.priority.cell().justify(Justify::Right),
                    opt_seconds(job.wait_time).cell().justify(Justify::Right),
                    opt_seconds(job.runtime).cell().justify(Justify::Right),
                    elastic_summary(job).cell(),
                    format_ts(Some(job.submit_time)).cell(),
                    job.command.as_str().cell(),
                ]
            })
            .collect();
        let header = vec![
            "ID".cell().bold(true),
            "Status".cell().bold(true),
            "CPUs".cell().bold(true),
            "Mem (MB)".cell().bold(true),
            "Prio".cell().bold(true),
            "Wait (s)".cell().bold(true),
            "Run (s)".cell().bold(true),
            "Elastic".cell().bold(true),
            "Submitted".cell().bold(true),
            "Command".cell().bold(true),
        ];
        self.print_horizontal_table(rows, header);
    }

    pub fn print_job_detail(&self, job: &Job) {
        let mut rows = vec![
            vec!["Job".cell().bold(true), job.id.cell()],
            vec![
                "User".cell().bold(true),
                job.user.as_deref().unwrap_or("-").cell(),
            ],
            vec!["Status".cell().bold(true), status_cell(job.status)],
            vec!["Priority".cell().bold(true), job.priority.cell()],
            vec!["Command".cell().bold(true), job.command.as_str().cell()],
        ];
        if job.is_elastic {
            rows.push(vec!["Type".cell().bold(true), "ELASTIC".cell()]);
            rows.push(vec![
                "CPUs".cell().bold(true),
                format!(
                    "{} (current: {}, min: {}, max: {})",
                    job.cpus,
                    job.allocated_cpus(),
                    opt_number(job.min_cpus),
                    opt_number(job.max_cpus),
                )
                .cell(),
            ]);
        } else {
            rows.push(vec!["CPUs".cell().bold(true), job.cpus.cell()]);
        }
        rows.push(vec![
            "Memory".cell().bold(true),
            human_mem_mb(job.mem_mb).cell(),
        ]);
        let nodes = job.node_list();
        if !nodes.is_empty() {
            rows.push(vec!["Nodes".cell().bold(true), nodes.join(",").cell()]);
        }
        rows.push(vec![
            "Submitted".cell().bold(true),
            format_ts(Some(job.submit_time)).cell(),
        ]);
        rows.push(vec![
            "Started".cell().bold(true),
            format_ts(job.start_time).cell(),
        ]);
        rows.push(vec![
            "Ended".cell().bold(true),
            format_ts(job.end_time).cell(),
        ]);
        rows.push(vec![
            "Wait time".cell().bold(true),
            opt_seconds(job.wait_time).cell(),
        ]);
        rows.push(vec![
            "Runtime".cell().bold(true),
            opt_seconds(job.runtime).cell(),
        ]);
        rows.push(vec![
            "Return code".cell().bold(true),
            job.return_code
                .map(|rc| rc.to_string())
                .unwrap_or_else(|| "-".to_string())
                .cell(),
        ]);
        rows.push(vec![
            "Stdout".cell().bold(true),
            job.stdout_path.as_deref().unwrap_or("-").cell(),
        ]);
        rows.push(vec![
            "Stderr".cell().bold(true),
            job.stderr_path.as_deref().unwrap_or("-").cell(),
        ]);
        if let Some(user_time) = job.cpu_user_time {
            rows.push(vec![
                "CPU user".cell().bold(true),
                format!("{user_time:.2}s").cell(),
            ]);
        }
        if let Some(system_time) = job.cpu_system_time {
            rows.push(vec![
                "CPU system".cell().bold(true),
                format!("{system_time:.2}s").cell(),
            ]);
        }
        if let Some(control_file) = &job.control_file {
            rows.push(vec![
                "Control".cell().bold(true),
                control_file.as_str().cell(),
            ]);
        }
        self.print_vertical_table(rows);
    }

    pub fn print_stats(
        &self,
        stats: &StoreStats,
        total_cpus: u32,
        total_mem_mb: u64,
        system: &SystemInfo,
    ) {
        println!("System resources");
        let mut rows = vec![
            vec!["Total CPUs".cell().bold(true), total_cpus.cell()],
            vec![
                "Used CPUs".cell().bold(true),
                format!(
                    "{} ({:.1}%)",
                    stats.used_cpus,
                    percent(stats.used_cpus as f64, total_cpus as f64)
                )
                .cell(),
            ],
            vec![
                "Available CPUs".cell().bold(true),
                (total_cpus as i64 - stats.used_cpus).max(0).cell(),
            ],
            vec![
                "Total memory".cell().bold(true),
                human_mem_mb(total_mem_mb).cell(),
            ],
            vec![
                "Used memory".cell().bold(true),
                format!(
                    "{} ({:.1}%)",
                    human_mem_mb(stats.used_mem_mb.max(0) as u64),
                    percent(stats.used_mem_mb as f64, total_mem_mb as f64)
                )
                .cell(),
            ],
        ];
        if let Some(cpu_percent) = system.cpu_percent {
            rows.push(vec![
                "System CPU".cell().bold(true),
                format!("{cpu_percent:.1}%").cell(),
            ]);
        }
        if let Some(mem_percent) = system.mem_percent {
            rows.push(vec![
                "System memory".cell().bold(true),
                format!("{mem_percent:.1}%").cell(),
            ]);
        }
        self.print_vertical_table(rows);

        println!("\nJob statistics");
        let mut rows = vec![
            vec!["Total jobs".cell().bold(true), stats.total_jobs.cell()],
            vec!["Running".cell().bold(true), stats.running_count.cell()],
            vec!["Pending".cell().bold(true), stats.pending_count.cell()],
        ];
        let mut statuses: Vec<(&String, &i64)> = stats.status_counts.iter().collect();
        statuses.sort_by(|a, b| a.0.cmp(b.0));
        for (status, count) in statuses {
            if status == "RUNNING" || status == "PENDING" {
                continue;
            }
            let share = percent(*count as f64, stats.total_jobs as f64);
            rows.push(vec![
                status.as_str().cell().bold(true),
                format!("{count} ({share:.1}%)").cell(),
            ]);
        }
        self.print_vertical_table(rows);

        if stats.completed_count > 0 {
            println!("\nPerformance (finished jobs)");
            let rows = vec![
                vec![
                    "Average wait time".cell().bold(true),
                    format!("{:.2}s", stats.avg_wait_time).cell(),
                ],
                vec![
                    "Average runtime".cell().bold(true),
                    format!("{:.2}s", stats.avg_runtime).cell(),
                ],
            ];
            self.print_vertical_table(rows);
        }
    }

    pub fn print_error(&self, error: &anyhow::Error) {
        eprintln!("{}", format!("Error: {error:?}").red());
    }
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part / whole * 100.0
    } else {
        0.0
    }
}

fn opt_seconds(value: Option<f64>) -> String {
    value
        .map(|v| format!("{v:.1}"))
        .unwrap_or_else(|| "-".to_string())
}

fn opt_number(value: Option<u32>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn elastic_summary(job: &Job) -> String {
    if job.is_elastic {
        format!("{}/{}", job.allocated_cpus(), opt_number(job.max_cpus))
    } else {
        String::new()
    }
}

fn status_cell(status: JobStatus) -> CellStruct {
    let color = match status {
        JobStatus::Pending => STATUS_COLOR_PENDING,
        JobStatus::Running => STATUS_COLOR_RUNNING,
        JobStatus::Completed => STATUS_COLOR_COMPLETED,
        JobStatus::Failed => STATUS_COLOR_FAILED,
        JobStatus::Cancelled => STATUS_COLOR_CANCELLED,
    };
    status.as_str().cell().foreground_color(Some(color))
}
