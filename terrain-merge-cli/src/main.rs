use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, Level};

use terrain_merge::pipeline::{export_hgt, merge_pyramids, SourceSpec, ZoomSelection};
use terrain_merge::store::TileStore;
use terrain_merge::{
    combine, read_hgt, Encoding, MbTiles, NodataPolicy, Resampling, RunConfig, RunContext,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// デバッグログを出力
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 2つのピラミッドを重ね合わせて新しいMBTilesを出力
    Merge {
        /// ベースとなるMBTiles（欠損部分を補う側）
        #[arg(value_name = "PRIMARY")]
        primary: PathBuf,

        /// 優先されるMBTiles（有効な値が常に勝つ側）
        #[arg(value_name = "SECONDARY")]
        secondary: PathBuf,

        /// 出力MBTiles
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// 処理するズームレベル
        #[arg(short, long, conflicts_with = "all_zooms", required_unless_present = "all_zooms")]
        zoom: Option<u8>,

        /// 入力に含まれる全ズームレベルを処理
        #[arg(long)]
        all_zooms: bool,

        #[command(flatten)]
        options: RunOptions,
    },

    /// 1秒メッシュのHGTファイルを書き出す
    Hgt {
        /// 入力MBTiles
        #[arg(value_name = "PRIMARY")]
        primary: PathBuf,

        /// 優先して重ねるMBTiles
        #[arg(value_name = "SECONDARY")]
        secondary: Option<PathBuf>,

        /// 出力ディレクトリ
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,

        /// 読み込むズームレベル（maxzoomを超える場合は切り詰める）
        #[arg(short, long, default_value_t = 12)]
        zoom: u8,

        #[command(flatten)]
        options: RunOptions,
    },

    /// 複数のMBTilesを1つにまとめる（後のファイルが優先）
    Combine {
        /// 出力MBTiles
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// 入力MBTiles
        #[arg(value_name = "INPUT", required = true)]
        inputs: Vec<PathBuf>,
    },

    /// MBTilesまたはHGTファイルの概要を表示
    Inspect {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunOptions {
    /// 入出力のエンコーディング（mapbox / terrarium）
    #[arg(long, default_value = "mapbox")]
    encoding: String,

    /// SECONDARYのエンコーディング（省略時は--encodingと同じ）
    #[arg(long)]
    secondary_encoding: Option<String>,

    /// Mapboxの標高間隔
    #[arg(long, default_value_t = 0.1)]
    interval: f64,

    /// Mapboxの基準標高
    #[arg(long, default_value_t = -10000.0, allow_negative_numbers = true)]
    base_val: f64,

    /// 追加でnodataとして扱う標高値
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    source_nodata: Vec<f32>,

    /// 標高0をnodataとして扱う
    #[arg(long)]
    zero_is_nodata: bool,

    /// リサンプリング方法（nearest / bilinear / lanczos）
    #[arg(long, default_value = "bilinear")]
    resampling: String,

    /// 並列処理スレッド数（デフォルト: CPUコア数、最大8）
    #[arg(short, long)]
    threads: Option<usize>,
}

impl RunOptions {
    fn parse_encoding(&self, name: &str) -> Result<Encoding> {
        let encoding: Encoding = name.parse()?;
        Ok(match encoding {
            Encoding::Mapbox { .. } => Encoding::mapbox_with(self.interval, self.base_val)?,
            Encoding::Terrarium => Encoding::Terrarium,
        })
    }

    /// 処理開始前に全パラメータを検証
    fn context(&self) -> Result<(RunContext, Encoding)> {
        let encoding = self.parse_encoding(&self.encoding)?;
        let secondary = match &self.secondary_encoding {
            Some(name) => self.parse_encoding(name)?,
            None => encoding,
        };

        // どちらかがMapboxなら(0,0,0)もnodata
        let mut nodata = match (encoding, secondary) {
            (Encoding::Terrarium, Encoding::Mapbox { .. }) => {
                NodataPolicy::for_encoding(&secondary)
            }
            _ => NodataPolicy::for_encoding(&encoding),
        }
        .with_values(self.source_nodata.iter().copied());
        nodata.zero_is_nodata = self.zero_is_nodata;

        let config = RunConfig {
            encoding,
            nodata,
            resampling: self.resampling.parse::<Resampling>()?,
            threads: self.threads,
        };
        Ok((RunContext::new(config)?, secondary))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // ログの初期化
    if cli.verbose {
        tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();
    } else {
        tracing_subscriber::fmt::init();
    }

    let start_time = std::time::Instant::now();

    match &cli.command {
        Command::Merge {
            primary,
            secondary,
            output,
            zoom,
            all_zooms,
            options,
        } => {
            let (ctx, secondary_encoding) = options.context()?;
            let zooms = match (zoom, all_zooms) {
                (_, true) => ZoomSelection::All,
                (Some(z), false) => ZoomSelection::Single(*z),
                (None, false) => anyhow::bail!("either --zoom or --all-zooms is required"),
            };
            let primary = SourceSpec::new(primary, ctx.config().encoding);
            let secondary = SourceSpec::new(secondary, secondary_encoding);

            let stats = merge_pyramids(&ctx, &primary, &secondary, output, zooms)
                .with_context(|| format!("Failed to merge into {:?}", output))?;
            info!(
                "Written {} tiles to {:?} ({} empty, {} failed)",
                stats.tiles_written, output, stats.tiles_empty, stats.tiles_failed
            );
        }
        Command::Hgt {
            primary,
            secondary,
            output,
            zoom,
            options,
        } => {
            let (ctx, secondary_encoding) = options.context()?;
            let primary = SourceSpec::new(primary, ctx.config().encoding);
            let secondary = secondary
                .as_ref()
                .map(|path| SourceSpec::new(path, secondary_encoding));

            let stats = export_hgt(&ctx, &primary, secondary.as_ref(), output, *zoom)
                .with_context(|| format!("Failed to export HGT into {:?}", output))?;
            info!(
                "Written {} HGT files to {:?} (zoom {})",
                stats.written.len(),
                output,
                stats.zoom
            );
            if stats.cells_failed > 0 {
                error!("{} cells could not be written", stats.cells_failed);
                anyhow::bail!("{} cells failed", stats.cells_failed);
            }
        }
        Command::Combine { output, inputs } => {
            let stats = combine(output, inputs)?;
            info!(
                "Combined {} files ({} tiles) into {:?}",
                stats.sources, stats.tiles_copied, output
            );
        }
        Command::Inspect { path } => inspect(path)?,
    }

    // 処理時間を表示
    info!("Total processing time: {:?}", start_time.elapsed());
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let is_hgt = path
        .extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("hgt"));

    if is_hgt {
        let grid = read_hgt(path)?;
        println!("cell:   {}", grid.cell());
        match grid.min_max() {
            Some((min, max)) => println!("range:  {} .. {} m", min, max),
            None => println!("range:  (all voids)"),
        }
        println!("voids:  {}", grid.void_count());
        return Ok(());
    }

    let store = MbTiles::open(path)?;
    for (name, value) in store.metadata()? {
        println!("{:<12} {}", name, value);
    }
    println!("maxzoom (parsed): {:?}", store.max_zoom()?);
    for zoom in store.zoom_levels()? {
        println!("z{:<3} {:>10} tiles", zoom, store.tile_count_at_zoom(zoom)?);
    }
    Ok(())
}
