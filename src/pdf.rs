use crate::geometry::Rect;

/// Largest decoded image accepted for a signature, 4096x4096 RGBA.
const MAX_IMAGE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Pdf(#[from] lopdf::Error),
    #[error("{0}")]
    Png(#[from] png::DecodingError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("page {0} does not exist")]
    PageNotFound(u32),
    #[error("{0}")]
    Syntax(String),
    #[error("unsupported image: {0}")]
    Unsupported(String),
}

pub struct Document {
    inner_doc: lopdf::Document,
    pages: std::collections::BTreeMap<u32, lopdf::ObjectId>,
}

#[derive(Debug, Clone, Copy)]
struct BoundingBox {
    ll: (f64, f64),
    ur: (f64, f64),
}

pub struct DocumentPage<'a> {
    page_id: lopdf::ObjectId,
    media_box: BoundingBox,
    inner_content: lopdf::content::Content,
    drawn: usize,
    doc: &'a mut Document,
}

enum ResourcesLocation {
    Inline,
    Indirect(lopdf::ObjectId),
    Missing,
}

fn as_number(obj: &lopdf::Object) -> Option<f64> {
    match obj {
        lopdf::Object::Integer(i) => Some(*i as f64),
        lopdf::Object::Real(r) => Some(*r as f64),
        _ => None
    }
}

fn real(v: f64) -> lopdf::Object {
    lopdf::Object::Real(v as _)
}

impl Document {
    pub fn load_mem(bytes: &[u8]) -> Result<Self, Error> {
        let doc = lopdf::Document::load_mem(bytes)?;
        Ok(Self {
            pages: doc.get_pages(),
            inner_doc: doc,
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn finalise(mut self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        self.inner_doc.save_to(&mut out)?;
        Ok(out)
    }

    pub fn page(&mut self, page: u32) -> Result<DocumentPage<'_>, Error> {
        let page_id = match self.pages.get(&page).copied() {
            Some(i) => i,
            None => return Err(Error::PageNotFound(page))
        };

        Ok(DocumentPage {
            media_box: self.get_media_box(page_id)?,
            inner_content: self.inner_doc.get_and_decode_page_content(page_id)?,
            drawn: 0,
            doc: self,
            page_id,
        })
    }

    pub fn png_to_xobj(&mut self, data: &[u8]) -> Result<lopdf::ObjectId, Error> {
        let mut img = png::Decoder::new_with_limits(data, png::Limits { bytes: MAX_IMAGE_BYTES });
        img.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
        let mut img_reader = img.read_info()?;
        let buf_size = img_reader.output_buffer_size();
        if buf_size > MAX_IMAGE_BYTES {
            let info = img_reader.info();
            return Err(Error::Unsupported(format!("image too large ({}x{})", info.width, info.height)));
        }
        let mut img_buf = vec![0; buf_size];
        let img_data = img_reader.next_frame(&mut img_buf)?;
        let img_bytes = &img_buf[..img_data.buffer_size()];

        if img_data.bit_depth != png::BitDepth::Eight {
            return Err(Error::Unsupported(format!("bit depth {:?}", img_data.bit_depth)));
        }

        let (img_bytes, img_bytes_format, mask_bytes) = match img_data.color_type {
            png::ColorType::Grayscale => (img_bytes.to_vec(), "DeviceGray", None),
            png::ColorType::Rgb => (img_bytes.to_vec(), "DeviceRGB", None),
            png::ColorType::GrayscaleAlpha => {
                let (gray_bytes, alpha_bytes) = split_alpha(img_bytes, 2);
                (gray_bytes, "DeviceGray", Some(alpha_bytes))
            }
            png::ColorType::Rgba => {
                let (rgb_bytes, alpha_bytes) = split_alpha(img_bytes, 4);
                (rgb_bytes, "DeviceRGB", Some(alpha_bytes))
            }
            png::ColorType::Indexed => return Err(Error::Unsupported("unexpanded palette".to_string()))
        };

        let mask_obj_id = mask_bytes.map(|mask_bytes| {
            let mask_dict = dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "ColorSpace" => "DeviceGray",
                "Width" => lopdf::Object::Integer(img_data.width.into()),
                "Height" => lopdf::Object::Integer(img_data.height.into()),
                "BitsPerComponent" => lopdf::Object::Integer(8),
                "Filter" => "FlateDecode"
            };
            let mask_obj = lopdf::Stream::new(mask_dict, deflate::deflate_bytes_zlib(&mask_bytes))
                .with_compression(false);
            self.inner_doc.add_object(mask_obj)
        });

        let mut img_dict = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "ColorSpace" => img_bytes_format,
            "Width" => lopdf::Object::Integer(img_data.width.into()),
            "Height" => lopdf::Object::Integer(img_data.height.into()),
            "BitsPerComponent" => lopdf::Object::Integer(8),
            "Filter" => "FlateDecode"
        };
        if let Some(mask_obj_id) = mask_obj_id {
            img_dict.set("SMask", lopdf::Object::Reference(mask_obj_id));
        }
        let img_obj = lopdf::Stream::new(img_dict, deflate::deflate_bytes_zlib(&img_bytes))
            .with_compression(false);

        Ok(self.inner_doc.add_object(img_obj))
    }

    fn resolve<'a>(&'a self, obj: &'a lopdf::Object) -> Result<&'a lopdf::Object, Error> {
        match obj {
            lopdf::Object::Reference(oid) => Ok(self.inner_doc.get_object(*oid)?),
            o => Ok(o)
        }
    }

    fn get_inherited_attr(&self, key: &[u8], page_id: lopdf::ObjectId) -> Result<&lopdf::Object, Error> {
        fn get_key<'a>(key: &[u8], page_node: &'a lopdf::Dictionary, doc: &'a lopdf::Document) -> Result<&'a lopdf::Object, lopdf::Error> {
            if let Ok(obj) = page_node.get(key) {
                Ok(obj)
            } else {
                let page_tree = page_node
                    .get(b"Parent")
                    .and_then(lopdf::Object::as_reference)
                    .and_then(|id| doc.get_dictionary(id))?;
                get_key(key, page_tree, doc)
            }
        }

        let page = self.inner_doc.get_dictionary(page_id)?;
        Ok(get_key(key, page, &self.inner_doc)?)
    }

    fn get_media_box(&self, page_id: lopdf::ObjectId) -> Result<BoundingBox, Error> {
        let media_box = self.get_inherited_attr(b"MediaBox", page_id)?;
        let media_box = self.resolve(media_box)?.as_array()?;
        if media_box.len() != 4 {
            return Err(Error::Syntax(format!("Expected MediaBox to have 4 elements, actually had {}", media_box.len())));
        }

        let media_box = media_box.iter()
            .map(|c| self.resolve(c).ok().and_then(as_number))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::Syntax("Invalid MediaBox coordinate".to_string()))?;

        let c1 = (media_box[0], media_box[1]);
        let c2 = (media_box[2], media_box[3]);

        Ok(BoundingBox {
            ll: (c1.0.min(c2.0), c1.1.min(c2.1)),
            ur: (c1.0.max(c2.0), c1.1.max(c2.1)),
        })
    }

    fn page_resources(&mut self, page_id: lopdf::ObjectId) -> Result<&mut lopdf::Dictionary, Error> {
        let location = match self.inner_doc.get_dictionary(page_id)?.get(b"Resources") {
            Ok(lopdf::Object::Dictionary(_)) => ResourcesLocation::Inline,
            Ok(lopdf::Object::Reference(oid)) => ResourcesLocation::Indirect(*oid),
            _ => ResourcesLocation::Missing,
        };

        match location {
            ResourcesLocation::Indirect(oid) => {
                return Ok(self.inner_doc.get_object_mut(oid)?.as_dict_mut()?);
            }
            ResourcesLocation::Missing => {
                // Pin inherited resources to the page so the parent's fonts survive the addition.
                let inherited = match self.get_inherited_attr(b"Resources", page_id) {
                    Ok(lopdf::Object::Reference(oid)) => self.inner_doc.get_dictionary(*oid)?.clone(),
                    Ok(lopdf::Object::Dictionary(d)) => d.clone(),
                    _ => lopdf::Dictionary::new(),
                };
                self.inner_doc.get_object_mut(page_id)?.as_dict_mut()?.set("Resources", inherited);
            }
            ResourcesLocation::Inline => {}
        }

        Ok(self.inner_doc.get_object_mut(page_id)?
            .as_dict_mut()?
            .get_mut(b"Resources")?
            .as_dict_mut()?)
    }

    fn add_xobject(&mut self, page_id: lopdf::ObjectId, xobject_name: &str, xobject_id: lopdf::ObjectId) -> Result<(), Error> {
        let xobjects_oid = match self.page_resources(page_id)?.get(b"XObject") {
            Ok(lopdf::Object::Reference(oid)) => Some(*oid),
            _ => None
        };

        let xobjects = match xobjects_oid {
            Some(oid) => self.inner_doc.get_object_mut(oid)?.as_dict_mut()?,
            None => {
                let resources = self.page_resources(page_id)?;
                if !resources.has(b"XObject") {
                    resources.set("XObject", lopdf::Dictionary::new());
                }
                resources.get_mut(b"XObject")?.as_dict_mut()?
            }
        };
        xobjects.set(xobject_name, lopdf::Object::Reference(xobject_id));
        Ok(())
    }
}

fn split_alpha(img_bytes: &[u8], channels: usize) -> (Vec<u8>, Vec<u8>) {
    let mut color_bytes = Vec::with_capacity((img_bytes.len() / channels) * (channels - 1));
    let mut alpha_bytes = Vec::with_capacity(img_bytes.len() / channels);

    for (i, byte) in img_bytes.iter().enumerate() {
        if i % channels == channels - 1 {
            alpha_bytes.push(*byte);
        } else {
            color_bytes.push(*byte);
        }
    }

    (color_bytes, alpha_bytes)
}

impl DocumentPage<'_> {
    /// Page width in points, taken from the (possibly inherited) MediaBox.
    pub fn width(&self) -> f64 {
        self.media_box.ur.0 - self.media_box.ll.0
    }

    /// Runs `f` against the page, then rewrites its content stream if anything was drawn.
    pub fn setup<R, F: FnOnce(&mut DocumentPage) -> R>(mut self, f: F) -> Result<R, Error> {
        // Isolate the existing content's graphics state from what gets drawn on top.
        self.inner_content.operations.insert(0, lopdf::content::Operation::new("q", vec![]));
        self.inner_content.operations.push(lopdf::content::Operation::new("Q", vec![]));

        let res = f(&mut self);
        if self.drawn == 0 {
            return Ok(res);
        }

        let content_id = self.doc.inner_doc.add_object(lopdf::Stream::new(
            dictionary! {},
            self.inner_content.encode()?,
        ));
        self.doc.inner_doc.get_object_mut(self.page_id)?
            .as_dict_mut()?
            .set("Contents", lopdf::Object::Reference(content_id));

        Ok(res)
    }

    pub fn add_png_img(&mut self, img_obj_id: lopdf::ObjectId, rect: &Rect) -> Result<(), Error> {
        let x = self.media_box.ll.0 + rect.left;
        let y = self.media_box.ur.1 - rect.bottom;

        let img_name = format!("Xsig{}", uuid::Uuid::new_v4().simple());
        self.doc.add_xobject(self.page_id, &img_name, img_obj_id)?;

        self.inner_content.operations.extend(vec![
            lopdf::content::Operation::new("q", vec![]),
            lopdf::content::Operation::new(
                "cm",
                vec![real(rect.width()), real(0.0), real(0.0), real(rect.height()), real(x), real(y)],
            ),
            lopdf::content::Operation::new("Do", vec![lopdf::Object::Name(img_name.into_bytes())]),
            lopdf::content::Operation::new("Q", vec![]),
        ]);
        self.drawn += 1;

        Ok(())
    }

    pub fn add_png(&mut self, data: &[u8], rect: &Rect) -> Result<(), Error> {
        let img_obj_id = self.doc.png_to_xobj(data)?;
        self.add_png_img(img_obj_id, rect)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use lopdf::content::{Content, Operation};
    use lopdf::{Object, Stream};

    /// A PDF whose pages inherit MediaBox and Resources from the page tree.
    pub fn blank_pdf(pages: u32, width: i64, height: i64) -> Vec<u8> {
        let mut doc = lopdf::Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! {
                "F1" => font_id,
            },
        });

        let mut kids = vec![];
        for _ in 0..pages {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![100.into(), 600.into()]),
                    Operation::new("Tj", vec![Object::string_literal("Sign here")]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(Object::Reference(page_id));
        }

        doc.objects.insert(pages_id, Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
            "Resources" => resources_id,
            "MediaBox" => vec![Object::Integer(0), Object::Integer(0), Object::Integer(width), Object::Integer(height)],
        }));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    pub fn rgba_png(width: u32, height: u32) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, width, height);
            encoder.set_color(png::ColorType::Rgba);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            let data = (0..width * height)
                .flat_map(|i| [20u8, 20, 120, if i % 2 == 0 { 255 } else { 0 }])
                .collect::<Vec<_>>();
            writer.write_image_data(&data).unwrap();
        }
        out
    }

    pub fn gray_png(width: u32, height: u32) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, width, height);
            encoder.set_color(png::ColorType::Grayscale);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            writer.write_image_data(&vec![0u8; (width * height) as usize]).unwrap();
        }
        out
    }

    fn crc32(bytes: &[u8]) -> u32 {
        let mut crc = 0xffff_ffffu32;
        for byte in bytes {
            crc ^= *byte as u32;
            for _ in 0..8 {
                crc = if crc & 1 == 1 { (crc >> 1) ^ 0xedb8_8320 } else { crc >> 1 };
            }
        }
        !crc
    }

    /// A tiny RGBA PNG whose IHDR claims the given dimensions, with a valid chunk CRC.
    pub fn oversized_png(width: u32, height: u32) -> Vec<u8> {
        let mut png = rgba_png(1, 1);
        // signature (8) + length (4), then "IHDR" and its 13 data bytes
        png[16..20].copy_from_slice(&width.to_be_bytes());
        png[20..24].copy_from_slice(&height.to_be_bytes());
        let crc = crc32(&png[12..29]);
        png[29..33].copy_from_slice(&crc.to_be_bytes());
        png
    }

    /// Reference to the content stream of the given page of a saved PDF.
    pub fn page_contents(bytes: &[u8], page: u32) -> lopdf::ObjectId {
        let doc = lopdf::Document::load_mem(bytes).unwrap();
        let page_id = *doc.get_pages().get(&page).unwrap();
        doc.get_dictionary(page_id).unwrap()
            .get(b"Contents").unwrap()
            .as_reference().unwrap()
    }

    /// Image XObjects drawn with `Do` on the given page of a saved PDF.
    pub fn drawn_xobjects(bytes: &[u8], page: u32) -> Vec<Vec<u8>> {
        let doc = lopdf::Document::load_mem(bytes).unwrap();
        let page_id = *doc.get_pages().get(&page).unwrap();
        doc.get_and_decode_page_content(page_id).unwrap()
            .operations
            .into_iter()
            .filter(|op| op.operator == "Do")
            .map(|op| op.operands[0].as_name().unwrap().to_vec())
            .collect()
    }
}
