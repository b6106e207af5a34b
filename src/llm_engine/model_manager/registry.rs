//! Model catalog - known models and local file lookup

use std::path::{Path, PathBuf};

use super::types::ModelDescriptor;

const CHATML_PREFIX: &str = "<|im_start|>user\n";
const CHATML_SUFFIX: &str = "<|im_end|>\n<|im_start|>assistant\n";
const LLAMA3_PREFIX: &str = "<|start_header_id|>user<|end_header_id|>\n\n";
const LLAMA3_SUFFIX: &str = "<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n";
const GEMMA_PREFIX: &str = "<start_of_turn>user\n";
const GEMMA_SUFFIX: &str = "<end_of_turn>\n<start_of_turn>model\n";

fn entry(
    name: &str,
    remote_uri: &str,
    prefix: &str,
    suffix: &str,
    stops: &[&str],
    description: &str,
) -> ModelDescriptor {
    ModelDescriptor {
        name: name.to_string(),
        file: None,
        remote_uri: Some(remote_uri.to_string()),
        download_id: None,
        input_prefix: Some(prefix.to_string()),
        input_suffix: Some(suffix.to_string()),
        stop_sequences: stops.iter().map(|s| s.to_string()).collect(),
        description: description.to_string(),
    }
}

/// Built-in catalog, in display order. `file` is never populated here.
pub fn available_models() -> Vec<ModelDescriptor> {
    vec![
        entry(
            "Qwen2.5 0.5B",
            "https://huggingface.co/lmstudio-community/Qwen2.5-0.5B-Instruct-GGUF/resolve/main/Qwen2.5-0.5B-Instruct-Q4_K_M.gguf?download=true",
            CHATML_PREFIX,
            CHATML_SUFFIX,
            &["<|im_end|>"],
            "0.5 billion parameters language model",
        ),
        entry(
            "Qwen2.5 1.5B",
            "https://huggingface.co/lmstudio-community/Qwen2.5-1.5B-Instruct-GGUF/resolve/main/Qwen2.5-1.5B-Instruct-Q4_K_M.gguf?download=true",
            CHATML_PREFIX,
            CHATML_SUFFIX,
            &["<|im_end|>"],
            "1.5 billion parameters language model",
        ),
        entry(
            "Llama3.2 1B",
            "https://huggingface.co/lmstudio-community/Llama-3.2-1B-Instruct-GGUF/resolve/main/Llama-3.2-1B-Instruct-Q4_K_M.gguf?download=true",
            LLAMA3_PREFIX,
            LLAMA3_SUFFIX,
            &["<|eot_id|>"],
            "1 billion parameters language model",
        ),
        entry(
            "Llama3.2 3B",
            "https://huggingface.co/lmstudio-community/Llama-3.2-3B-Instruct-GGUF/resolve/main/Llama-3.2-3B-Instruct-Q4_K_M.gguf?download=true",
            LLAMA3_PREFIX,
            LLAMA3_SUFFIX,
            &["<|eot_id|>"],
            "3 billion parameters language model",
        ),
        entry(
            "Gemma2 2B",
            "https://huggingface.co/lmstudio-ai/gemma-2b-it-GGUF/resolve/main/gemma-2b-it-q4_k_m.gguf",
            GEMMA_PREFIX,
            GEMMA_SUFFIX,
            &["<start_of_turn>user", "<start_of_turn>model", "<end_of_turn>", "<eos>"],
            "2 billion parameters language model",
        ),
        entry(
            "Phi3.5 mini",
            "https://huggingface.co/bartowski/Phi-3.5-mini-instruct-GGUF/resolve/main/Phi-3.5-mini-instruct-Q4_K_M.gguf?download=true",
            "<|user|>\n",
            "<|end|>\n<|assistant|>\n",
            &["<|end|>", "<|assistant|>"],
            "3.8 billion parameters language model",
        ),
        entry(
            "Mistral 7B",
            "https://huggingface.co/lmstudio-community/Mistral-7B-Instruct-v0.3-GGUF/resolve/main/Mistral-7B-Instruct-v0.3-Q4_K_M.gguf?download=true",
            "[INST]",
            "[/INST]",
            &[],
            "7.3 billion parameters language model",
        ),
        entry(
            "Llama3.1 8B",
            "https://huggingface.co/lmstudio-community/Meta-Llama-3.1-8B-Instruct-GGUF/resolve/main/Meta-Llama-3.1-8B-Instruct-Q4_K_M.gguf?download=true",
            LLAMA3_PREFIX,
            LLAMA3_SUFFIX,
            &["<|eot_id|>"],
            "8 billion parameters language model",
        ),
        entry(
            "Gemma2 9B",
            "https://huggingface.co/bartowski/gemma-2-9b-it-GGUF/resolve/main/gemma-2-9b-it-Q4_K_M.gguf",
            GEMMA_PREFIX,
            GEMMA_SUFFIX,
            &["<start_of_turn>user", "<start_of_turn>model", "<end_of_turn>"],
            "8.5 billion parameters language model",
        ),
    ]
}

/// Known models plus the directory their weight files land in
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    downloads_dir: PathBuf,
    entries: Vec<ModelDescriptor>,
}

impl ModelCatalog {
    /// Catalog backed by the built-in model list
    pub fn new(downloads_dir: impl Into<PathBuf>) -> Self {
        Self::with_entries(downloads_dir, available_models())
    }

    pub fn with_entries(downloads_dir: impl Into<PathBuf>, entries: Vec<ModelDescriptor>) -> Self {
        Self {
            downloads_dir: downloads_dir.into(),
            entries,
        }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    /// Build the visible model list.
    ///
    /// Declaration order, no deduplication. Each entry whose remote file name
    /// exists in the downloads directory gets `file` populated.
    pub fn build_list(&self) -> Vec<ModelDescriptor> {
        self.entries
            .iter()
            .map(|model| match self.local_file_for(model) {
                Some(path) => model.with_file(path),
                None => model.clone(),
            })
            .collect()
    }

    /// Local path for a model's remote file name, if that file exists
    pub fn local_file_for(&self, model: &ModelDescriptor) -> Option<PathBuf> {
        let file_name = model.remote_file_name()?;
        find_file_named(&self.downloads_dir, &file_name)
    }
}

/// Exact-name match of a regular file inside `dir`
pub fn find_file_named(dir: &Path, file_name: &str) -> Option<PathBuf> {
    let candidate = dir.join(file_name);
    if candidate.is_file() {
        Some(candidate)
    } else {
        None
    }
}
