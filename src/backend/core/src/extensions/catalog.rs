use crate::toolkit::ToolkitBackend;

use super::ExtensionKind;

/// A catalog entry before host and environment state is applied.
#[derive(Debug, Clone, Copy)]
pub(super) struct CatalogEntry {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ExtensionKind,
    pub backend: Option<ToolkitBackend>,
    pub packages: &'static [&'static str],
}

const fn engine(
    id: &'static str,
    name: &'static str,
    description: &'static str,
    backend: ToolkitBackend,
) -> CatalogEntry {
    CatalogEntry {
        id,
        name,
        description,
        kind: ExtensionKind::Engine,
        backend: Some(backend),
        packages: &["llama-cpp-python"],
    }
}

pub(super) const CATALOG: &[CatalogEntry] = &[
    engine("llama-cpp-cpu", "llama.cpp (CPU)", "GGUF inference on the CPU", ToolkitBackend::Cpu),
    engine("llama-cpp-cuda", "llama.cpp (CUDA)", "GGUF inference on NVIDIA GPUs", ToolkitBackend::Cuda),
    engine("llama-cpp-rocm", "llama.cpp (ROCm)", "GGUF inference on AMD GPUs", ToolkitBackend::Rocm),
    engine("llama-cpp-metal", "llama.cpp (Metal)", "GGUF inference on Apple Silicon", ToolkitBackend::Metal),
    engine("llama-cpp-vulkan", "llama.cpp (Vulkan)", "GGUF inference on any Vulkan GPU", ToolkitBackend::Vulkan),
    engine(
        "llama-cpp-openblas",
        "llama.cpp (OpenBLAS)",
        "GGUF inference with BLAS-accelerated prompt processing",
        ToolkitBackend::Openblas,
    ),
    CatalogEntry {
        id: "document-processing",
        name: "Document processing",
        description: "PDF, Word and HTML text extraction",
        kind: ExtensionKind::PackageSet,
        backend: None,
        packages: &["pypdf", "python-docx", "beautifulsoup4"],
    },
    CatalogEntry {
        id: "ocr",
        name: "OCR",
        description: "Text recognition in scanned documents and images",
        kind: ExtensionKind::PackageSet,
        backend: None,
        packages: &["pytesseract", "pillow"],
    },
    CatalogEntry {
        id: "speech",
        name: "Speech",
        description: "Speech-to-text transcription",
        kind: ExtensionKind::PackageSet,
        backend: None,
        packages: &["faster-whisper", "soundfile"],
    },
];

pub(super) fn find(id: &str) -> Option<&'static CatalogEntry> {
    CATALOG.iter().find(|e| e.id == id)
}
