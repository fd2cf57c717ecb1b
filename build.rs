// Build script to compile GLSL shaders to SPIR-V
//
// Every `shaders/*.vert` and `shaders/*.frag` is compiled next to itself as
// `<file>.spv`. A missing or failing glslc only warns: the library and its
// tests run on the headless backend and never read the SPIR-V.

use std::path::{Path, PathBuf};
use std::process::Command;

const SHADER_DIR: &str = "shaders";

fn main() {
    println!("cargo:rerun-if-changed={}", SHADER_DIR);

    let Ok(entries) = std::fs::read_dir(SHADER_DIR) else {
        return;
    };

    let mut sources: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| matches!(path.extension().and_then(|e| e.to_str()), Some("vert" | "frag")))
        .collect();
    sources.sort();

    for source in sources {
        println!("cargo:rerun-if-changed={}", source.display());
        let mut output = source.clone().into_os_string();
        output.push(".spv");
        compile_shader(&source, Path::new(&output));
    }
}

fn compile_shader(input: &Path, output: &Path) {
    // Check if glslc is available
    let result = Command::new("glslc").arg(input).arg("-o").arg(output).status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            println!(
                "cargo:warning=Failed to compile {}: exit code {:?}",
                input.display(),
                status.code()
            );
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), {} not compiled", e, input.display());
            println!(
                "cargo:warning=Install the Vulkan SDK or run: glslc {} -o {}",
                input.display(),
                output.display()
            );
        }
    }
}
