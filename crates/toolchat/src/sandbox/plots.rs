//! Plot capture for sandboxed executions.
//!
//! A [`PlotSink`] prepares the scratch directory before the child starts
//! (returning the environment the child needs) and reports the image files
//! the run produced once it has exited. The runner moves those files into
//! the [`ArtifactStore`](super::ArtifactStore) before the scratch directory
//! is deleted.

use std::io;
use std::path::{Path, PathBuf};

/// Capture hook for images produced by executed code.
pub trait PlotSink: Send + Sync {
    /// Set up `scratch` for a run. Returns extra environment variables for
    /// the child process.
    fn prepare(&self, scratch: &Path) -> io::Result<Vec<(String, String)>>;

    /// Image files produced by the run, in the order they were created.
    fn collect(&self, scratch: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Backend module name, importable because the scratch directory is the
/// script's directory.
const BACKEND_MODULE: &str = "toolchat_plot_backend";

const PLOT_DIR: &str = "plots";

/// Non-interactive matplotlib backend that saves figures instead of showing
/// them. `show()` saves every open figure; figures still open at exit are
/// saved too.
const BACKEND_SOURCE: &str = r#"import atexit
import os

from matplotlib._pylab_helpers import Gcf
from matplotlib.backend_bases import FigureManagerBase
from matplotlib.backends.backend_agg import FigureCanvasAgg

FigureCanvas = FigureCanvasAgg
FigureManager = FigureManagerBase

_plot_dir = os.environ.get("TOOLCHAT_PLOT_DIR", "plots")
_counter = [0]


def new_figure_manager(num, *args, FigureClass=None, **kwargs):
    from matplotlib.figure import Figure

    figure = (FigureClass or Figure)(*args, **kwargs)
    return new_figure_manager_given_figure(num, figure)


def new_figure_manager_given_figure(num, figure):
    return FigureManagerBase(FigureCanvasAgg(figure), num)


def _save_open_figures():
    managers = Gcf.get_all_fig_managers()
    for manager in managers:
        _counter[0] += 1
        path = os.path.join(_plot_dir, "plot_%d.png" % _counter[0])
        manager.canvas.figure.savefig(path, dpi=150, bbox_inches="tight", facecolor="white")
    if managers:
        Gcf.destroy_all()


def show(*args, **kwargs):
    _save_open_figures()


atexit.register(_save_open_figures)
"#;

/// Default sink: selects a file-saving matplotlib backend through
/// `MPLBACKEND` and collects `plots/plot_<n>.png`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatplotlibFileSink;

impl PlotSink for MatplotlibFileSink {
    fn prepare(&self, scratch: &Path) -> io::Result<Vec<(String, String)>> {
        let plot_dir = scratch.join(PLOT_DIR);
        std::fs::create_dir_all(&plot_dir)?;
        std::fs::write(scratch.join(format!("{BACKEND_MODULE}.py")), BACKEND_SOURCE)?;
        let mpl_config = scratch.join(".matplotlib");
        std::fs::create_dir_all(&mpl_config)?;

        Ok(vec![
            ("MPLBACKEND".into(), format!("module://{BACKEND_MODULE}")),
            ("MPLCONFIGDIR".into(), mpl_config.to_string_lossy().into_owned()),
            ("TOOLCHAT_PLOT_DIR".into(), plot_dir.to_string_lossy().into_owned()),
        ])
    }

    fn collect(&self, scratch: &Path) -> io::Result<Vec<PathBuf>> {
        let plot_dir = scratch.join(PLOT_DIR);
        if !plot_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut plots: Vec<(u32, PathBuf)> = std::fs::read_dir(&plot_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter_map(|path| {
                let n = plot_number(&path)?;
                Some((n, path))
            })
            .collect();
        plots.sort_by_key(|(n, _)| *n);
        Ok(plots.into_iter().map(|(_, path)| path).collect())
    }
}

/// `plot_12.png` -> `12`
fn plot_number(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix("plot_")?
        .strip_suffix(".png")?
        .parse()
        .ok()
}
