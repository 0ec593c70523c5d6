//! Per-variant help menus (`-H SIM|FIT|BBC`)

use crate::config::PipelineVariant;

const COMMON: &str = "\
CONFIG keys shared by every variant:
  OUTDIR:               output directory (relative to the launch directory)
  BATCH_INFO:           <submit-cmd> <template> <ncore>   scheduler backend
  BATCH_CANCEL:         cancel command for BATCH_INFO (default from submit-cmd)
  NODELIST:             node1 node2 ...                  ssh backend, one slot per node
  NCORE:                local worker slots (default 1)
  JOBNAME:              program each task runs
  FAIL_FAST:            any failed task marks the run FAILED (default false)
  MERGE_LOCK_WAIT_SEC:  bounded wait for MERGE.BUSY (default 5)
  MERGE_LOCK_STALE_SEC: age after which MERGE.BUSY is reclaimed (default 600)
  MERGE_RECHECK_SEC:    interval between full-merge passes (default 60)

Templates for BATCH_INFO may use REPLACE_NAME, REPLACE_LOGFILE and REPLACE_JOB.
Progress is recorded in OUTDIR/MERGE.LOG; OUTDIR/ALL.DONE appears when the run ends.
";

const SIM: &str = "\
Simulation input

GENVERSION_LIST:
  - GENVERSION:    MY_SIM_A          # one task per entry
    GENOPT:        GENRANGE_REDSHIFT 0.1 0.9
    SIMGEN_INFILE: other.input       # optional per-version override
CONFIG:
  SIMGEN_INFILE:   sim.input
  GENOPT_GLOBAL:   RANSEED 12345     # appended to every version

--fast scales generation by NGEN_SCALE 0.1.
Without OUTDIR, output goes to SIMLOGS_<input stem>.
";

const FIT: &str = "\
Light-curve fit input

CONFIG:
  VERSION:   [DATA_A, DATA_B]             # data versions
  FITOPT:                                 # FITOPT000 is the default fit
    - /LABEL/ FITOPT_ARGS
  OUTDIR:    FIT_OUTPUT

One task per VERSION and FITOPT, named <VERSION>-FITOPT<nnn>.
--fast adds SIM_PRESCALE 10.
";

const BBC: &str = "\
BBC input

CONFIG:
  INPDIR+:  [FIT_OUTPUT_A, FIT_OUTPUT_B]    # passed as datafile=
  MUOPT:                                    # MUOPT000 runs the input as written
    - /LABEL/ key=value
  OUTDIR:   BBC_OUTPUT
#END_YAML
u1=1
...                                         # program input follows the marker

One task per MUOPT, named BBC-MUOPT<nnn>.
--fast adds prescale_simdata=10.
";

pub fn help_text(variant: PipelineVariant) -> String {
    let body = match variant {
        PipelineVariant::Simulation => SIM,
        PipelineVariant::Fit => FIT,
        PipelineVariant::BiasCorrection => BBC,
    };
    format!(
        "submit_batch help for {} ({})\n\n{}\n{}",
        variant,
        variant.tag(),
        body,
        COMMON
    )
}
