use rand::seq::SliceRandom;

/// Expansion parameters for one `work push` invocation.
#[derive(Debug, Clone)]
pub struct JobParams {
    /// First frame, inclusive.
    pub start: u32,
    /// Last frame, inclusive.
    pub end: u32,
    /// Frames per task.
    pub step: u32,
    /// Horizontal subframe subdivisions; 0 disables tiling.
    pub subdiv_x: u32,
    /// Vertical subframe subdivisions; 0 disables tiling.
    pub subdiv_y: u32,
    pub job_name: String,
    pub job_url: String,
    /// Shuffle the task list for load balancing.
    pub randomize: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("shebang (#!) is missing from task script")]
    MissingShebang,
    #[error("frame step must be >= 1")]
    ZeroStep,
}

/// Expand a task template into concrete task scripts.
///
/// The frame range `[start, end]` is partitioned into chunks of `step`
/// frames; each chunk yields one script with `$START`/`$END`/`$STEP`
/// substituted. With both subdivisions set, each chunk further expands into
/// `subdiv_x * subdiv_y` scripts covering the unit frame in tiles via the
/// `$SF_MIN_X`/`$SF_MAX_X`/`$SF_MIN_Y`/`$SF_MAX_Y` macros.
/// A range with `end < start` expands to no tasks.
pub fn expand_tasks(template: &str, params: &JobParams) -> Result<Vec<String>, TemplateError> {
    if !template.starts_with("#!") {
        return Err(TemplateError::MissingShebang);
    }
    if params.step == 0 {
        return Err(TemplateError::ZeroStep);
    }

    let mut tasks = Vec::new();
    let mut chunk_start = params.start;
    while chunk_start <= params.end {
        let chunk_end = params.end.min(chunk_start + params.step - 1);
        let script = substitute(
            template,
            &[
                ("$JOB_NAME", params.job_name.as_str()),
                ("$JOB_URL", params.job_url.as_str()),
                ("$START", &chunk_start.to_string()),
                ("$END", &chunk_end.to_string()),
                ("$STEP", &params.step.to_string()),
            ],
        );
        if params.subdiv_x > 0 && params.subdiv_y > 0 {
            for (min_x, max_x, min_y, max_y) in subframes(params.subdiv_x, params.subdiv_y) {
                tasks.push(substitute(
                    &script,
                    &[
                        ("$SF_MIN_X", &min_x),
                        ("$SF_MAX_X", &max_x),
                        ("$SF_MIN_Y", &min_y),
                        ("$SF_MAX_Y", &max_y),
                    ],
                ));
            }
        } else {
            tasks.push(script);
        }
        match chunk_start.checked_add(params.step) {
            Some(next) => chunk_start = next,
            None => break,
        }
    }

    if params.randomize {
        tasks.shuffle(&mut rand::rng());
    }
    Ok(tasks)
}

/// Sub-rectangle bounds of the unit frame, as canonical decimal strings.
///
/// `f64` display is the shortest representation that round-trips, so the
/// same grid always yields byte-identical scripts.
fn subframes(subdiv_x: u32, subdiv_y: u32) -> Vec<(String, String, String, String)> {
    let mut out = Vec::with_capacity(subdiv_x as usize * subdiv_y as usize);
    for i in 0..subdiv_x {
        let min_x = f64::from(i) / f64::from(subdiv_x);
        let max_x = f64::from(i + 1) / f64::from(subdiv_x);
        for j in 0..subdiv_y {
            let min_y = f64::from(j) / f64::from(subdiv_y);
            let max_y = f64::from(j + 1) / f64::from(subdiv_y);
            out.push((
                min_x.to_string(),
                max_x.to_string(),
                min_y.to_string(),
                max_y.to_string(),
            ));
        }
    }
    out
}

fn substitute(script: &str, macros: &[(&str, &str)]) -> String {
    let mut out = script.to_string();
    for (key, value) in macros {
        out = out.replace(key, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(start: u32, end: u32, step: u32) -> JobParams {
        JobParams {
            start,
            end,
            step,
            subdiv_x: 0,
            subdiv_y: 0,
            job_name: "NONE".to_string(),
            job_url: "NONE".to_string(),
            randomize: false,
        }
    }

    const TEMPLATE: &str = "#!/bin/sh\nrender -s $START -e $END -j $STEP\n";

    #[test]
    fn rejects_template_without_shebang() {
        let err = expand_tasks("render $START", &params(1, 3, 1)).unwrap_err();
        assert!(matches!(err, TemplateError::MissingShebang));
    }

    #[test]
    fn one_frame_per_task() {
        let tasks = expand_tasks(TEMPLATE, &params(1, 3, 1)).unwrap();
        assert_eq!(
            tasks,
            vec![
                "#!/bin/sh\nrender -s 1 -e 1 -j 1\n",
                "#!/bin/sh\nrender -s 2 -e 2 -j 1\n",
                "#!/bin/sh\nrender -s 3 -e 3 -j 1\n",
            ]
        );
    }

    #[test]
    fn backwards_range_expands_to_nothing() {
        let tasks = expand_tasks(TEMPLATE, &params(10, 3, 1)).unwrap();
        assert!(tasks.is_empty());
    }

    #[test]
    fn last_chunk_is_clamped() {
        let tasks = expand_tasks(TEMPLATE, &params(1, 10, 4)).unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks[0].contains("-s 1 -e 4"));
        assert!(tasks[1].contains("-s 5 -e 8"));
        assert!(tasks[2].contains("-s 9 -e 10"));
    }

    #[test]
    fn partition_covers_range_without_overlap() {
        for (start, end, step) in [(1u32, 100u32, 7u32), (5, 5, 3), (10, 47, 10)] {
            let tasks = expand_tasks(TEMPLATE, &params(start, end, step)).unwrap();
            let mut next = start;
            for task in &tasks {
                let s: u32 = field(task, "-s");
                let e: u32 = field(task, "-e");
                assert_eq!(s, next, "gap or overlap at frame {next}");
                assert!(e >= s);
                next = e + 1;
            }
            assert_eq!(next, end + 1, "range not fully covered");
        }
    }

    #[test]
    fn job_macros_substituted() {
        let mut p = params(1, 1, 1);
        p.job_name = "shot01".to_string();
        p.job_url = "s3://projects/shot01.tgz".to_string();
        let tasks =
            expand_tasks("#!/bin/sh\nfetch $JOB_URL # $JOB_NAME\n", &p).unwrap();
        assert_eq!(tasks[0], "#!/bin/sh\nfetch s3://projects/shot01.tgz # shot01\n");
    }

    #[test]
    fn subframe_grid_is_exact() {
        let mut p = params(10, 10, 1);
        p.subdiv_x = 2;
        p.subdiv_y = 3;
        let tasks = expand_tasks(
            "#!/bin/sh\ntile $SF_MIN_X $SF_MAX_X $SF_MIN_Y $SF_MAX_Y\n",
            &p,
        )
        .unwrap();
        let got: Vec<&str> = tasks.iter().map(|t| t.lines().nth(1).unwrap()).collect();
        assert_eq!(
            got,
            vec![
                "tile 0 0.5 0 0.3333333333333333",
                "tile 0 0.5 0.3333333333333333 0.6666666666666666",
                "tile 0 0.5 0.6666666666666666 1",
                "tile 0.5 1 0 0.3333333333333333",
                "tile 0.5 1 0.3333333333333333 0.6666666666666666",
                "tile 0.5 1 0.6666666666666666 1",
            ]
        );
    }

    #[test]
    fn subframes_tile_the_unit_square() {
        for (sx, sy) in [(1u32, 1u32), (2, 2), (3, 5)] {
            let tiles = subframes(sx, sy);
            assert_eq!(tiles.len(), (sx * sy) as usize);
            for (min_x, max_x, min_y, max_y) in &tiles {
                let (min_x, max_x): (f64, f64) = (min_x.parse().unwrap(), max_x.parse().unwrap());
                let (min_y, max_y): (f64, f64) = (min_y.parse().unwrap(), max_y.parse().unwrap());
                assert!(min_x < max_x && min_y < max_y);
                assert!((0.0..=1.0).contains(&min_x) && (0.0..=1.0).contains(&max_x));
                assert!((0.0..=1.0).contains(&min_y) && (0.0..=1.0).contains(&max_y));
            }
            // Edges meet exactly: each column's max is the next column's min.
            let sum: f64 = tiles
                .iter()
                .map(|(min_x, max_x, min_y, max_y)| {
                    let w: f64 = max_x.parse::<f64>().unwrap() - min_x.parse::<f64>().unwrap();
                    let h: f64 = max_y.parse::<f64>().unwrap() - min_y.parse::<f64>().unwrap();
                    w * h
                })
                .sum();
            assert!((sum - 1.0).abs() < 1e-9, "tiles must cover the unit square");
        }
    }

    #[test]
    fn randomize_keeps_the_same_tasks() {
        let mut p = params(1, 20, 1);
        p.randomize = true;
        let mut shuffled = expand_tasks(TEMPLATE, &p).unwrap();
        p.randomize = false;
        let mut plain = expand_tasks(TEMPLATE, &p).unwrap();
        shuffled.sort();
        plain.sort();
        assert_eq!(shuffled, plain);
    }

    fn field(task: &str, flag: &str) -> u32 {
        task.split_whitespace()
            .skip_while(|w| *w != flag)
            .nth(1)
            .unwrap()
            .parse()
            .unwrap()
    }
}
